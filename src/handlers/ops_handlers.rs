//! Operational and billing-collaborator endpoints.

use crate::{
    errors::{AppError, EngineError},
    handlers::AppState,
    models::quota::{EffectiveLimits, UsageReport},
    services::sweeper::SweepReport,
};
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /ops/sweep` runs one maintenance sweep now.
pub async fn run_sweep(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.engine.sweeper.run_once(Utc::now()).await)
}

/// `GET /users/{id}/usage`
pub async fn usage(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UsageReport>, AppError> {
    Ok(Json(state.engine.usage(user_id).await?))
}

#[derive(Debug, Serialize)]
pub struct CacheVersionResponse {
    pub user_id: Uuid,
    pub version: i64,
}

/// `GET /users/{id}/cache-version`
pub async fn cache_version(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CacheVersionResponse>, AppError> {
    let version = state
        .engine
        .cache
        .current_version(user_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(CacheVersionResponse { user_id, version }))
}

#[derive(Debug, Deserialize)]
pub struct PlanChange {
    pub plan_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `PUT /users/{id}/plan`
pub async fn change_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(change): Json<PlanChange>,
) -> Result<Json<EffectiveLimits>, AppError> {
    let limits = state
        .engine
        .on_plan_changed(user_id, &change.plan_id, change.expires_at)
        .await?;
    Ok(Json(limits))
}

/// `DELETE /users/{id}/plan`
pub async fn expire_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EffectiveLimits>, AppError> {
    Ok(Json(state.engine.on_plan_expired(user_id).await?))
}
