//! Defines the operational HTTP surface.
//!
//! ## Structure
//! - **Probes**: `GET /healthz`, `GET /readyz`
//! - **Operations**: `POST /ops/sweep`
//! - **Billing / cache collaborators**
//!   - `GET    /users/{id}/usage`
//!   - `GET    /users/{id}/cache-version`
//!   - `PUT    /users/{id}/plan`
//!   - `DELETE /users/{id}/plan`
//! - **Local backend data plane** (presigned)
//!   - `PUT /objects/{*key}` receives an upload part
//!   - `GET /objects/{*key}` streams an object
//!
//! The wildcard `*key` allows nested keys like `uploads/{owner}/2025/01/02/a_b.jpg`.

use crate::{
    handlers::{
        AppState,
        health_handlers::{healthz, readyz},
        object_handlers::{download_object, upload_part},
        ops_handlers::{cache_version, change_plan, expire_plan, run_sweep, usage},
    },
    services::{engine::Engine, local_object_storage::LocalObjectStorage},
};
use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;

/// Build the router. Object routes answer 404 unless `local_objects` is set.
pub fn routes(engine: Engine, local_objects: Option<Arc<LocalObjectStorage>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/ops/sweep", post(run_sweep))
        .route("/users/{id}/usage", get(usage))
        .route("/users/{id}/cache-version", get(cache_version))
        .route("/users/{id}/plan", put(change_plan).delete(expire_plan))
        .route("/objects/{*key}", put(upload_part).get(download_object))
        .with_state(AppState {
            engine,
            local_objects,
        })
}
