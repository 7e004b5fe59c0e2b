use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use clipcache_core::{ClipResponse, ServeError};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{responses, AppState};

/// `GET /videos/{name}`: stream a clip, downloading it on a cache miss.
pub async fn clip_get(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let cancel = CancellationToken::new();
    // Fires if hyper drops this future because the client went away before
    // the response head was produced.
    let disconnect = cancel.clone().drop_guard();
    let result = state.coordinator().serve(&name, cancel).await;
    disconnect.disarm();
    match result {
        Ok(clip) => clip_response(clip),
        Err(err) => {
            if !matches!(err, ServeError::Aborted) {
                debug!(clip = %name, kind = err.kind(), error = %err, "clip request failed");
            }
            responses::serve_error(&err)
        }
    }
}

fn clip_response(clip: ClipResponse) -> Response {
    let mut response = Response::new(Body::from_stream(clip.body.into_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        "x-cache",
        HeaderValue::from_static(clip.source.as_header()),
    );
    if let Some(len) = clip.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    // Cache keys are validated to [a-z0-9_.], so they are always valid header text.
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", clip.key)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// `GET /admin/clips/stats`
pub async fn clip_stats(State(state): State<AppState>) -> Response {
    let cache = state.coordinator().stats().await;
    responses::json_ok(json!({
        "cache": cache,
        "counters": state.metrics().stats(),
    }))
}
