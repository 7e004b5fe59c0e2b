use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use clipcache_core::ServeError;
use serde_json::{json, Value};

/// Nginx's "client closed request"; only ever recorded in logs.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

pub fn json_ok(value: Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub fn problem_response(status: StatusCode, kind: &str, detail: Option<&str>) -> Response {
    let mut body = json!({
        "type": "about:blank",
        "title": status.canonical_reason().unwrap_or("Error"),
        "status": status.as_u16(),
        "kind": kind,
    });
    if let Some(detail) = detail {
        body["detail"] = Value::String(detail.to_string());
    }
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    response
}

pub fn status_for(err: &ServeError) -> StatusCode {
    match err {
        ServeError::InvalidRequest(_)
        | ServeError::InvalidCamera(_)
        | ServeError::VideoNotFound { .. } => StatusCode::NOT_FOUND,
        ServeError::CameraUnavailable { .. } | ServeError::Upstream(_) | ServeError::Timeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServeError::Aborted => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ServeError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn serve_error(err: &ServeError) -> Response {
    let status = status_for(err);
    match err {
        // The client is gone; the status only feeds the access log.
        ServeError::Aborted => status.into_response(),
        // Internal details stay in the server log.
        ServeError::Unknown(_) => problem_response(status, err.kind(), None),
        _ => problem_response(status, err.kind(), Some(&err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (ServeError::InvalidRequest("x".into()), 404),
            (ServeError::InvalidCamera(3), 404),
            (
                ServeError::VideoNotFound {
                    camera_id: 1,
                    timestamp: 0,
                },
                404,
            ),
            (
                ServeError::CameraUnavailable {
                    camera_id: 1,
                    reason: "down".into(),
                },
                503,
            ),
            (ServeError::Upstream("HTTP 500".into()), 503),
            (ServeError::Timeout(Duration::from_secs(30)), 503),
            (ServeError::Unknown("disk".into()), 500),
            (ServeError::Aborted, 499),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{err}");
        }
    }

    #[test]
    fn problem_carries_kind_and_content_type() {
        let response = serve_error(&ServeError::InvalidCamera(7));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }
}
