//! coldvault: storage lifecycle and bulk operations engine.
//!
//! Files move between a warm object store and a deep archival tier under a
//! compare-and-set state machine, with chunked uploads, bulk operations,
//! quota enforcement and per-user cache versioning on top.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
