use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clipcache_core::upstream::{Listing, RemoteEntry, RemoteTransfer, SessionToken};
use clipcache_core::{ClipCoordinator, Config, MetricsObserver, NvrApi, UpstreamError};
use futures_util::stream;

use crate::AppState;

pub const CAMERA_ROOT: &str = "/mnt/cam1";
pub const CLIP_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42-fake-clip";

/// Recorder with a single recording at 2023-11-14 23:13:20 local time.
#[derive(Default)]
pub struct ScriptedNvr {
    unreachable: AtomicBool,
    fetches: AtomicUsize,
}

impl ScriptedNvr {
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NvrApi for ScriptedNvr {
    async fn login(&self) -> Result<SessionToken, UpstreamError> {
        Ok(SessionToken {
            token: "test-token".into(),
            raw: None,
        })
    }

    async fn list(
        &self,
        remote_path: &str,
        date_path: &str,
        _token: &str,
    ) -> Result<Listing, UpstreamError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".into()));
        }
        let entries = if remote_path == CAMERA_ROOT && date_path == "2023-11-14/23" {
            vec![RemoteEntry {
                filename: "ch01_20231114_231320.mp4".into(),
                size: Some(CLIP_BYTES.len() as u64),
            }]
        } else {
            Vec::new()
        };
        Ok(Listing {
            success: true,
            has_data: !entries.is_empty(),
            entries,
        })
    }

    async fn fetch(
        &self,
        _remote_path: &str,
        _remote_filename: &str,
        _token: &str,
    ) -> Result<RemoteTransfer, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (head, tail) = CLIP_BYTES.split_at(8);
        let chunks = vec![
            Ok::<Bytes, io::Error>(Bytes::from_static(head)),
            Ok(Bytes::from_static(tail)),
        ];
        Ok(RemoteTransfer {
            status: 200,
            content_length: Some(CLIP_BYTES.len() as u64),
            body: Box::pin(stream::iter(chunks)),
        })
    }
}

pub async fn app_state(cache_dir: &Path, nvr: Arc<ScriptedNvr>) -> AppState {
    let mut config = Config::default();
    config.cache.cache_dir = cache_dir.to_path_buf();
    config.cache.safety_margin_bytes = 0;
    config
        .cameras
        .insert("1".into(), CAMERA_ROOT.to_string());
    let metrics = Arc::new(MetricsObserver::new());
    let coordinator = ClipCoordinator::from_config(&config, nvr, metrics.clone())
        .await
        .expect("coordinator for tests");
    AppState::new(coordinator, metrics)
}
