//! Core data models for the lifecycle engine.
//!
//! These map to SQLite tables via `sqlx::FromRow` and serialize as JSON via
//! `serde` for the operational API.

pub mod file_record;
pub mod lifecycle_job;
pub mod multipart;
pub mod quota;
pub mod upload_session;
