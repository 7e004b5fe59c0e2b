//! Scripted recorder for unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::Semaphore;

use crate::upstream::{
    ByteStream, Listing, NvrApi, RemoteEntry, RemoteTransfer, SessionToken, UpstreamError,
};

#[derive(Clone)]
enum FolderScript {
    Files(Vec<String>),
    Fail,
}

pub(crate) struct FakeNvr {
    logins: AtomicUsize,
    lists: AtomicUsize,
    fetches: AtomicUsize,
    fail_logins: AtomicBool,
    fail_all_listings: AtomicBool,
    stall_body: AtomicBool,
    truncate_body: AtomicBool,
    fetch_status: AtomicU16,
    login_delay: Duration,
    folders: Mutex<HashMap<String, FolderScript>>,
    listed: Mutex<Vec<String>>,
    body: Vec<Bytes>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeNvr {
    pub(crate) fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fail_logins: AtomicBool::new(false),
            fail_all_listings: AtomicBool::new(false),
            stall_body: AtomicBool::new(false),
            truncate_body: AtomicBool::new(false),
            fetch_status: AtomicU16::new(200),
            login_delay: Duration::ZERO,
            folders: Mutex::new(HashMap::new()),
            listed: Mutex::new(Vec::new()),
            body: vec![
                Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"),
                Bytes::from_static(b"moov-and-mdat-payload"),
                Bytes::from_static(b"-tail"),
            ],
            gate: None,
        }
    }

    pub(crate) fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    /// Every body chunk waits for a permit released via [`FakeNvr::release_chunks`].
    pub(crate) fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub(crate) fn release_chunks(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub(crate) fn with_folder(self, remote_path: &str, date_path: &str, files: &[&str]) -> Self {
        self.folders.lock().unwrap().insert(
            format!("{remote_path}/{date_path}"),
            FolderScript::Files(files.iter().map(|f| f.to_string()).collect()),
        );
        self
    }

    pub(crate) fn with_failing_folder(self, remote_path: &str, date_path: &str) -> Self {
        self.folders
            .lock()
            .unwrap()
            .insert(format!("{remote_path}/{date_path}"), FolderScript::Fail);
        self
    }

    pub(crate) fn fail_logins(&self, fail: bool) {
        self.fail_logins.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_all_listings(&self, fail: bool) {
        self.fail_all_listings.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn stall_body(&self, stall: bool) {
        self.stall_body.store(stall, Ordering::SeqCst);
    }

    /// Advertise the full length but end the body one chunk early.
    pub(crate) fn truncate_body(&self, truncate: bool) {
        self.truncate_body.store(truncate, Ordering::SeqCst);
    }

    pub(crate) fn set_fetch_status(&self, status: u16) {
        self.fetch_status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn listed_paths(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }

    pub(crate) fn body_bytes(&self) -> Vec<u8> {
        self.body.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

#[async_trait]
impl NvrApi for FakeNvr {
    async fn login(&self) -> Result<SessionToken, UpstreamError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        if self.fail_logins.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unauthorized);
        }
        Ok(SessionToken {
            token: format!("token-{n}"),
            raw: None,
        })
    }

    async fn list(
        &self,
        remote_path: &str,
        date_path: &str,
        _token: &str,
    ) -> Result<Listing, UpstreamError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let full = format!("{remote_path}/{date_path}");
        self.listed.lock().unwrap().push(full.clone());
        if self.fail_all_listings.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".into()));
        }
        let script = self.folders.lock().unwrap().get(&full).cloned();
        match script {
            Some(FolderScript::Fail) => Err(UpstreamError::Status { status: 502 }),
            Some(FolderScript::Files(files)) => Ok(Listing {
                has_data: !files.is_empty(),
                entries: files
                    .into_iter()
                    .map(|filename| RemoteEntry {
                        filename,
                        size: None,
                    })
                    .collect(),
                success: true,
            }),
            None => Ok(Listing {
                entries: Vec::new(),
                success: false,
                has_data: false,
            }),
        }
    }

    async fn fetch(
        &self,
        _remote_path: &str,
        _remote_filename: &str,
        _token: &str,
    ) -> Result<RemoteTransfer, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let status = self.fetch_status.load(Ordering::SeqCst);
        let content_length = self.body.iter().map(|b| b.len() as u64).sum::<u64>();
        if !(200..300).contains(&status) {
            return Ok(RemoteTransfer {
                status,
                content_length: None,
                body: Box::pin(stream::empty::<io::Result<Bytes>>()),
            });
        }
        let body: ByteStream = if self.stall_body.load(Ordering::SeqCst) {
            Box::pin(stream::pending::<io::Result<Bytes>>())
        } else {
            let mut chunks = self.body.clone();
            if self.truncate_body.load(Ordering::SeqCst) {
                chunks.pop();
            }
            let gate = self.gate.clone();
            Box::pin(stream::unfold(
                (chunks.into_iter(), gate),
                |(mut chunks, gate)| async move {
                    let chunk = chunks.next()?;
                    if let Some(gate) = &gate {
                        gate.acquire().await.ok()?.forget();
                    }
                    Some((Ok::<Bytes, io::Error>(chunk), (chunks, gate)))
                },
            ))
        };
        Ok(RemoteTransfer {
            status,
            content_length: Some(content_length),
            body,
        })
    }
}
