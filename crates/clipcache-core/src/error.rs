use std::time::Duration;

use crate::key::KeyError;
use crate::locator::LocateError;

/// Everything a clip request can end in besides success. `Clone` because a
/// single download outcome is handed to every request that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServeError {
    #[error("invalid clip name: {0}")]
    InvalidRequest(String),
    #[error("camera {0} is not configured")]
    InvalidCamera(u32),
    #[error("no recording for camera {camera_id} near {timestamp}")]
    VideoNotFound { camera_id: u32, timestamp: i64 },
    #[error("camera {camera_id} unavailable: {reason}")]
    CameraUnavailable { camera_id: u32, reason: String },
    #[error("recorder transfer failed: {0}")]
    Upstream(String),
    #[error("recorder stalled for {0:?}")]
    Timeout(Duration),
    #[error("client disconnected")]
    Aborted,
    #[error("internal error: {0}")]
    Unknown(String),
}

impl ServeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::InvalidRequest(_) => "invalid_request",
            ServeError::InvalidCamera(_) => "invalid_camera",
            ServeError::VideoNotFound { .. } => "video_not_found",
            ServeError::CameraUnavailable { .. } => "camera_unavailable",
            ServeError::Upstream(_) => "upstream_error",
            ServeError::Timeout(_) => "timeout",
            ServeError::Aborted => "abort",
            ServeError::Unknown(_) => "unknown",
        }
    }

    /// True for outcomes that mean "nothing to serve" rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ServeError::InvalidRequest(_)
                | ServeError::InvalidCamera(_)
                | ServeError::VideoNotFound { .. }
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ServeError::CameraUnavailable { .. } | ServeError::Upstream(_) | ServeError::Timeout(_)
        )
    }
}

impl From<KeyError> for ServeError {
    fn from(err: KeyError) -> Self {
        ServeError::InvalidRequest(err.to_string())
    }
}

impl From<LocateError> for ServeError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::InvalidCamera(camera_id) => ServeError::InvalidCamera(camera_id),
            LocateError::NotFound {
                camera_id, target, ..
            } => ServeError::VideoNotFound {
                camera_id,
                timestamp: target,
            },
            LocateError::CameraUnavailable { camera_id, reason } => {
                ServeError::CameraUnavailable { camera_id, reason }
            }
        }
    }
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Unknown(err.to_string())
    }
}
