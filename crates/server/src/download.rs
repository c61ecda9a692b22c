//! Download gateway
//!
//! Serves a session's most recent package file by session ID. The ID is the
//! only capability: unknown IDs, files that vanished from disk, and records
//! that somehow point at a non-package file all collapse into the same 404
//! so the route leaks nothing about other sessions.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::artifacts::has_package_extension;
use crate::state::AppState;

/// GET /download/{session_id}
pub async fn download_handler(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(record) = state.artifact_for(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !has_package_extension(&record.path) {
        warn!(
            component = "download",
            event = "download.bad_extension",
            session_id = %session_id,
            path = %record.path.display(),
            "Artifact record points at a non-package file"
        );
        return StatusCode::NOT_FOUND.into_response();
    }

    let file = match tokio::fs::File::open(&record.path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(
                component = "download",
                event = "download.open_failed",
                session_id = %session_id,
                path = %record.path.display(),
                error = %e,
                "Artifact file missing or unreadable"
            );
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);

    info!(
        component = "download",
        event = "download.served",
        session_id = %session_id,
        filename = %record.filename,
        bytes = bytes,
        "Serving package download"
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let disposition = format!(
        "attachment; filename=\"{}\"",
        urlencoding::encode(&record.filename)
    );
    match HeaderValue::from_str(&disposition) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    }

    // Stream the file rather than buffering it; decks are small today but
    // the handler should not assume that.
    let body = Body::from_stream(ReaderStream::new(file));
    (StatusCode::OK, headers, body).into_response()
}
