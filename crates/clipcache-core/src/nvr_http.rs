//! Recorder client over HTTP.
//!
//! `POST {base}/api/login` takes `{"username","password"}` and answers with a
//! `token`. `GET {base}/api/files?path=&token=` lists one folder and
//! `GET {base}/api/download?path=&file=&token=` streams a recording.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::NvrConfig;
use crate::upstream::{
    ByteStream, Listing, NvrApi, RemoteTransfer, SessionToken, UpstreamError,
};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("CLIPCACHE_HTTP_CONNECT_TIMEOUT_SECS", 3).max(1))
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("CLIPCACHE_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("CLIPCACHE_HTTP_POOL_IDLE_SECS", 90).max(1))
}

fn user_agent() -> String {
    format!("clipcache/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder. No overall timeout: transfers can run for minutes, so
/// short calls set `.timeout(...)` per request instead.
pub fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout())
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
}

fn transport(err: reqwest::Error) -> UpstreamError {
    if err.is_decode() {
        UpstreamError::Decode(err.to_string())
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), UpstreamError> {
    match status.as_u16() {
        401 | 403 => Err(UpstreamError::Unauthorized),
        code if !status.is_success() => Err(UpstreamError::Status { status: code }),
        _ => Ok(()),
    }
}

pub struct HttpNvr {
    base: String,
    username: String,
    password: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HttpNvr {
    pub fn new(cfg: &NvrConfig) -> Result<Self, UpstreamError> {
        let client = client_builder()
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Ok(Self {
            base: cfg.base_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            request_timeout: cfg.request_timeout(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl NvrApi for HttpNvr {
    async fn login(&self) -> Result<SessionToken, UpstreamError> {
        let resp = self
            .client
            .post(self.url("/api/login"))
            .timeout(self.request_timeout)
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await
            .map_err(transport)?;
        check_status(resp.status())?;
        let raw: Value = resp.json().await.map_err(transport)?;
        let token = raw
            .get("token")
            .or_else(|| raw.pointer("/data/token"))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| UpstreamError::Decode("login response carries no token".into()))?
            .to_string();
        Ok(SessionToken {
            token,
            raw: Some(raw),
        })
    }

    async fn list(
        &self,
        remote_path: &str,
        date_path: &str,
        token: &str,
    ) -> Result<Listing, UpstreamError> {
        let folder = format!("{remote_path}/{date_path}");
        let resp = self
            .client
            .get(self.url("/api/files"))
            .timeout(self.request_timeout)
            .query(&[("path", folder.as_str()), ("token", token)])
            .send()
            .await
            .map_err(transport)?;
        check_status(resp.status())?;
        let listing: Listing = resp.json().await.map_err(transport)?;
        debug!(
            folder = %folder,
            entries = listing.entries.len(),
            success = listing.success,
            "listed recorder folder"
        );
        Ok(listing)
    }

    async fn fetch(
        &self,
        remote_path: &str,
        remote_filename: &str,
        token: &str,
    ) -> Result<RemoteTransfer, UpstreamError> {
        let request = self
            .client
            .get(self.url("/api/download"))
            .query(&[
                ("path", remote_path),
                ("file", remote_filename),
                ("token", token),
            ])
            .send();
        // Only the response head is bounded here; the body is paced by the caller.
        let resp = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| UpstreamError::Transport("timed out waiting for response head".into()))?
            .map_err(transport)?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let body: ByteStream = Box::pin(resp.bytes_stream().map_err(io::Error::other));
        Ok(RemoteTransfer {
            status,
            content_length,
            body,
        })
    }
}
