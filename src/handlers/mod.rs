pub mod health_handlers;
pub mod object_handlers;
pub mod ops_handlers;

use crate::services::{engine::Engine, local_object_storage::LocalObjectStorage};
use std::sync::Arc;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Present when the warm tier is the local disk backend, which serves its
    /// own presigned URLs.
    pub local_objects: Option<Arc<LocalObjectStorage>>,
}
