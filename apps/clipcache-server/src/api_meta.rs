use axum::response::IntoResponse;
use serde_json::json;

use crate::responses;

/// Liveness probe.
pub async fn healthz() -> impl IntoResponse {
    responses::json_ok(json!({ "ok": true }))
}

pub async fn about() -> impl IntoResponse {
    responses::json_ok(json!({
        "service": "clipcache",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
