//! Contract with the network video recorder. The production implementation
//! lives in [`crate::nvr_http`]; tests script their own.

use std::fmt;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("recorder answered HTTP {status}")]
    Status { status: u16 },
    #[error("recorder rejected credentials")]
    Unauthorized,
    #[error("malformed recorder response: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct SessionToken {
    pub token: String,
    /// Raw login payload, kept for diagnostics.
    pub raw: Option<serde_json::Value>,
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Listing {
    #[serde(default, alias = "data")]
    pub entries: Vec<RemoteEntry>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "hasData")]
    pub has_data: bool,
}

/// An opened transfer. `status` is the recorder's HTTP status; the body is only
/// meaningful when it is a success code.
pub struct RemoteTransfer {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl RemoteTransfer {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for RemoteTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTransfer")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait NvrApi: Send + Sync + 'static {
    async fn login(&self) -> Result<SessionToken, UpstreamError>;

    /// List one folder: `remote_path` is the camera root, `date_path` the
    /// `YYYY-MM-DD/HH[D]` suffix below it.
    async fn list(
        &self,
        remote_path: &str,
        date_path: &str,
        token: &str,
    ) -> Result<Listing, UpstreamError>;

    async fn fetch(
        &self,
        remote_path: &str,
        remote_filename: &str,
        token: &str,
    ) -> Result<RemoteTransfer, UpstreamError>;
}
