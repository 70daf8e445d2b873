//! Presigned object routes served by the local disk backend.
//! Bodies are streamed in both directions, never buffered whole.

use crate::{
    errors::AppError,
    handlers::AppState,
    services::local_object_storage::{LocalObjectStorage, SignedParams},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;

fn local_backend(state: &AppState) -> Result<&Arc<LocalObjectStorage>, AppError> {
    state
        .local_objects
        .as_ref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "object routes are not enabled"))
}

/// `PUT /objects/{*key}?uploadId=&partNumber=&expires=&signature=`
///
/// Receives one part of a chunked upload. Responds with the part's ETag.
pub async fn upload_part(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
    body: Body,
) -> Result<Response, AppError> {
    let local = local_backend(&state)?;
    if !local.signer().verify("PUT", &key, &params) {
        return Err(AppError::forbidden("invalid or expired signature"));
    }
    let (Some(upload_id), Some(part_number)) = (params.upload_id.as_deref(), params.part_number)
    else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "uploadId and partNumber are required",
        ));
    };

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    let etag = local
        .receive_part(upload_id, &key, part_number, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /objects/{*key}?expires=&signature=` as a streaming response.
pub async fn download_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<Response, AppError> {
    let local = local_backend(&state)?;
    if params.upload_id.is_some() || !local.signer().verify("GET", &key, &params) {
        return Err(AppError::forbidden("invalid or expired signature"));
    }

    let (file, len) = local.open_object(&key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    Ok(response)
}
