use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Streams one recorded segment from `<root>/<feed_id>/<file_name>`.
pub async fn serve_recording(
    State(state): State<SharedState>,
    Path((feed_id, file_name)): Path<(i64, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. Only plain file names inside the feed directory
    let file_path = state
        .recording_path(feed_id, &file_name)
        .ok_or((StatusCode::BAD_REQUEST, "Invalid file name".to_string()))?;

    // 2. Open the file for reading
    let file = File::open(&file_path).await.map_err(|e| {
        debug!("Recording {:?} not available: {}", file_path, e);
        (StatusCode::NOT_FOUND, "File not found".to_string())
    })?;

    // 3. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| {
            error!("Failed to build recording response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}
