//! Cache-aside serving of clips.
//!
//! A request is answered from disk when the clip is cached. Otherwise it either
//! joins the download already running for that key or becomes its leader: the
//! leader takes a transfer slot, locates the clip on the recorder and streams
//! the body to its client while writing it to a `.part` sibling. Only a fully
//! written, length-checked file is renamed into place. A client that goes away
//! mid-transfer cancels the write; the partial file is discarded and joiners
//! start over.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, Config, DownloadConfig, LocatorConfig};
use crate::error::ServeError;
use crate::key::CacheKey;
use crate::limiter::{DownloadLimiter, DownloadSlot};
use crate::locator::{ClipLocator, RemoteClipDescriptor};
use crate::observer::CacheObserver;
use crate::retention::{CacheEntryMetadata, RetentionManager, RetentionSnapshot};
use crate::session::SessionCache;
use crate::singleflight::{DownloadRegistry, Flight, FlightLeader, FlightOutcome};
use crate::upstream::{ByteStream, NvrApi, RemoteTransfer, UpstreamError};

/// Chunks buffered between the transfer task and a slow client.
const CLIENT_BUFFER_CHUNKS: usize = 16;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_concurrent: usize,
    /// Deadline for locating the clip and opening the transfer.
    pub safety_timeout: Duration,
    /// Longest silence tolerated between body chunks.
    pub idle_timeout: Option<Duration>,
    /// How many times a request re-registers after joining aborted downloads.
    pub join_retry_limit: u32,
}

impl From<&DownloadConfig> for CoordinatorSettings {
    fn from(cfg: &DownloadConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent,
            safety_timeout: cfg.safety_timeout(),
            idle_timeout: cfg.idle_timeout(),
            join_retry_limit: cfg.join_retry_limit,
        }
    }
}

/// Everything needed to assemble a coordinator.
pub struct CoordinatorParts {
    pub cache: CacheConfig,
    pub settings: CoordinatorSettings,
    pub locator: LocatorConfig,
    pub cameras: HashMap<u32, String>,
    pub session_ttl: Duration,
    pub api: Arc<dyn NvrApi>,
    pub observer: Arc<dyn CacheObserver>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipSource {
    /// Already on disk.
    Cache,
    /// Written by a download this request waited on.
    Joined,
    /// Streamed from the recorder by this request.
    Origin,
}

impl ClipSource {
    pub fn as_header(&self) -> &'static str {
        match self {
            ClipSource::Cache | ClipSource::Joined => "HIT",
            ClipSource::Origin => "MISS",
        }
    }
}

pub struct ClipResponse {
    pub key: CacheKey,
    pub source: ClipSource,
    pub content_length: Option<u64>,
    pub body: ClipBody,
}

pub enum ClipBody {
    File(File),
    Stream(ClipStream),
}

impl ClipBody {
    pub fn into_stream(self) -> ByteStream {
        match self {
            ClipBody::File(file) => Box::pin(ReaderStream::new(file)),
            ClipBody::Stream(stream) => Box::pin(stream),
        }
    }
}

/// Body of a clip being downloaded. Dropping it cancels the transfer.
pub struct ClipStream {
    chunks: ReceiverStream<io::Result<Bytes>>,
    _disconnect: DropGuard,
}

impl Stream for ClipStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub cache: RetentionSnapshot,
    pub in_flight: usize,
    pub download_slots_in_use: usize,
    pub download_slots_max: usize,
    pub recorder_logins: u64,
}

struct InflightMark {
    observer: Arc<dyn CacheObserver>,
    key: String,
}

impl InflightMark {
    fn start(observer: &Arc<dyn CacheObserver>, key: &str) -> Self {
        observer.download_started(key);
        Self {
            observer: Arc::clone(observer),
            key: key.to_string(),
        }
    }
}

impl Drop for InflightMark {
    fn drop(&mut self) {
        self.observer.download_ended(&self.key);
    }
}

/// State handed to the task that copies one transfer.
struct Transfer {
    key: CacheKey,
    leader: FlightLeader,
    slot: DownloadSlot,
    inflight: InflightMark,
    started: Instant,
    part_path: PathBuf,
    final_path: PathBuf,
    expected: Option<u64>,
    body: ByteStream,
    file: BufWriter<File>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
}

pub struct ClipCoordinator {
    root: PathBuf,
    settings: CoordinatorSettings,
    api: Arc<dyn NvrApi>,
    session: Arc<SessionCache>,
    locator: Arc<ClipLocator>,
    limiter: DownloadLimiter,
    flights: DownloadRegistry,
    retention: Arc<RetentionManager>,
    observer: Arc<dyn CacheObserver>,
}

impl ClipCoordinator {
    pub async fn from_config(
        config: &Config,
        api: Arc<dyn NvrApi>,
        observer: Arc<dyn CacheObserver>,
    ) -> anyhow::Result<Arc<Self>> {
        let cameras = config.camera_table()?;
        Self::build(CoordinatorParts {
            cache: config.cache.clone(),
            settings: CoordinatorSettings::from(&config.downloads),
            locator: config.locator.clone(),
            cameras,
            session_ttl: config.nvr.session_ttl(),
            api,
            observer,
        })
        .await
        .with_context(|| {
            format!(
                "preparing cache directory {}",
                config.cache.cache_dir.display()
            )
        })
    }

    pub async fn build(parts: CoordinatorParts) -> io::Result<Arc<Self>> {
        fs::create_dir_all(&parts.cache.cache_dir).await?;
        let root = fs::canonicalize(&parts.cache.cache_dir).await?;
        let session = Arc::new(SessionCache::new(parts.api.clone(), parts.session_ttl));
        let locator = Arc::new(ClipLocator::new(
            &parts.locator,
            parts.cameras,
            parts.api.clone(),
            session.clone(),
        ));
        let retention = Arc::new(RetentionManager::new(root.clone(), &parts.cache));
        Ok(Arc::new(Self {
            root,
            limiter: DownloadLimiter::new(parts.settings.max_concurrent),
            settings: parts.settings,
            api: parts.api,
            session,
            locator,
            flights: DownloadRegistry::new(),
            retention,
            observer: parts.observer,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub async fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.retention.snapshot().await,
            in_flight: self.flights.in_flight(),
            download_slots_in_use: self.limiter.in_use(),
            download_slots_max: self.limiter.max(),
            recorder_logins: self.session.login_count(),
        }
    }

    /// Serve the clip named `name`. `cancel` signals that the client went
    /// away; it is also fired when a streamed body is dropped.
    pub async fn serve(
        self: &Arc<Self>,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ClipResponse, ServeError> {
        let result = self.serve_inner(name, cancel).await;
        if let Err(err) = &result {
            self.observer.error(err.kind());
        }
        result
    }

    async fn serve_inner(
        self: &Arc<Self>,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ClipResponse, ServeError> {
        let key = CacheKey::parse(name)?;
        let final_path = self.clip_path(&key)?;
        let mut source = ClipSource::Cache;

        for attempt in 0..=self.settings.join_retry_limit {
            if let Some(found) = self.open_cached(&key, &final_path, source).await? {
                return Ok(found);
            }
            let leader = match self.flights.begin(key.as_str()) {
                Flight::Leader(leader) => leader,
                Flight::Follower(follower) => {
                    self.observer.coalesced(key.as_str());
                    debug!(key = %key, attempt, "joining in-flight download");
                    let outcome = tokio::select! {
                        outcome = follower.wait() => outcome,
                        _ = cancel.cancelled() => return Err(ServeError::Aborted),
                    };
                    match outcome {
                        FlightOutcome::Completed => {
                            source = ClipSource::Joined;
                            if let Some(found) =
                                self.open_cached(&key, &final_path, source).await?
                            {
                                return Ok(found);
                            }
                            // Evicted before we could open it.
                        }
                        FlightOutcome::Aborted => {
                            info!(key = %key, attempt, "joined download was aborted; retrying");
                        }
                        FlightOutcome::Failed(err) => return Err(err),
                    }
                    continue;
                }
            };

            // The previous leader may have finished between the disk check
            // and registration.
            match self.open_cached(&key, &final_path, source).await {
                Ok(Some(found)) => {
                    leader.complete(FlightOutcome::Completed);
                    return Ok(found);
                }
                Ok(None) => {}
                Err(err) => {
                    leader.complete(FlightOutcome::Failed(err.clone()));
                    return Err(err);
                }
            }
            self.observer.cache_miss(key.as_str());
            return self.download(key, final_path, leader, cancel).await;
        }

        warn!(
            key = %key,
            retries = self.settings.join_retry_limit,
            "giving up after repeated aborted downloads"
        );
        Err(ServeError::Unknown(format!(
            "download of {key} was aborted {} times",
            self.settings.join_retry_limit + 1
        )))
    }

    fn clip_path(&self, key: &CacheKey) -> Result<PathBuf, ServeError> {
        let path = self.root.join(key.as_str());
        if path.parent() != Some(self.root.as_path()) {
            return Err(ServeError::InvalidRequest(format!(
                "{key} resolves outside the cache directory"
            )));
        }
        Ok(path)
    }

    async fn open_cached(
        &self,
        key: &CacheKey,
        path: &Path,
        source: ClipSource,
    ) -> Result<Option<ClipResponse>, ServeError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        if !self.retention.on_access(key.as_str()).await {
            let report = self
                .retention
                .on_add(CacheEntryMetadata::new(key, len, Utc::now()))
                .await;
            self.observer
                .evicted(report.evicted.len(), report.bytes_freed);
        }
        if source == ClipSource::Cache {
            self.observer.cache_hit(key.as_str());
        }
        debug!(key = %key, bytes = len, ?source, "serving clip from disk");
        Ok(Some(ClipResponse {
            key: key.clone(),
            source,
            content_length: Some(len),
            body: ClipBody::File(file),
        }))
    }

    async fn download(
        self: &Arc<Self>,
        key: CacheKey,
        final_path: PathBuf,
        leader: FlightLeader,
        cancel: CancellationToken,
    ) -> Result<ClipResponse, ServeError> {
        let slot = tokio::select! {
            slot = self.limiter.acquire() => slot,
            _ = cancel.cancelled() => {
                leader.complete(FlightOutcome::Aborted);
                return Err(ServeError::Aborted);
            }
        };
        let inflight = InflightMark::start(&self.observer, key.as_str());
        let started = Instant::now();

        let limit = self.settings.safety_timeout;
        let opened = tokio::select! {
            opened = tokio::time::timeout(limit, self.open_transfer(&key)) => {
                opened.unwrap_or(Err(ServeError::Timeout(limit)))
            }
            _ = cancel.cancelled() => Err(ServeError::Aborted),
        };
        let (descriptor, transfer) = match opened {
            Ok(found) => found,
            Err(err) => {
                resolve_failed(leader, &key, &err);
                return Err(err);
            }
        };

        let report = self
            .retention
            .ensure_space(transfer.content_length.unwrap_or(0))
            .await;
        self.observer
            .evicted(report.evicted.len(), report.bytes_freed);

        let part_path = self.root.join(key.part_name());
        let file = match File::create(&part_path).await {
            Ok(file) => file,
            Err(err) => {
                let err = ServeError::from(err);
                resolve_failed(leader, &key, &err);
                return Err(err);
            }
        };

        info!(
            key = %key,
            folder = %descriptor.remote_path,
            remote = %descriptor.remote_filename,
            bytes = ?transfer.content_length,
            "downloading clip"
        );
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER_CHUNKS);
        let content_length = transfer.content_length;
        let job = Transfer {
            key: key.clone(),
            leader,
            slot,
            inflight,
            started,
            part_path,
            final_path,
            expected: content_length,
            body: transfer.body,
            file: BufWriter::new(file),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(Arc::clone(self).run_transfer(job));

        Ok(ClipResponse {
            key,
            source: ClipSource::Origin,
            content_length,
            body: ClipBody::Stream(ClipStream {
                chunks: ReceiverStream::new(rx),
                _disconnect: cancel.drop_guard(),
            }),
        })
    }

    async fn open_transfer(
        &self,
        key: &CacheKey,
    ) -> Result<(RemoteClipDescriptor, RemoteTransfer), ServeError> {
        let descriptor = self.locator.locate_key(key).await?;
        let token =
            self.session
                .get_token()
                .await
                .map_err(|err| ServeError::CameraUnavailable {
                    camera_id: key.camera_id(),
                    reason: format!("login failed: {err}"),
                })?;
        let transfer = match self
            .api
            .fetch(&descriptor.remote_path, &descriptor.remote_filename, &token)
            .await
        {
            Ok(transfer) => transfer,
            Err(UpstreamError::Unauthorized) => {
                self.session.invalidate().await;
                return Err(ServeError::Upstream(
                    "recorder rejected the session".into(),
                ));
            }
            Err(err) => return Err(ServeError::Upstream(err.to_string())),
        };
        if !transfer.is_success() {
            match transfer.status {
                401 | 403 => self.session.invalidate().await,
                404 => self.locator.forget(key).await,
                _ => {}
            }
            return Err(ServeError::Upstream(format!(
                "recorder answered HTTP {} for {}",
                transfer.status, descriptor.remote_filename
            )));
        }
        Ok((descriptor, transfer))
    }

    async fn run_transfer(self: Arc<Self>, job: Transfer) {
        let Transfer {
            key,
            leader,
            slot: _slot,
            inflight: _inflight,
            started,
            part_path,
            final_path,
            expected,
            mut body,
            mut file,
            tx,
            cancel,
        } = job;

        let copied = self.copy_body(&mut body, &mut file, &tx, &cancel).await;
        let result = match copied {
            Ok(written) => finish_file(file, &part_path, &final_path, expected, written)
                .await
                .map(|()| written),
            Err(err) => {
                drop(file);
                Err(err)
            }
        };

        match result {
            Ok(written) => {
                let report = self
                    .retention
                    .on_add(CacheEntryMetadata::new(&key, written, Utc::now()))
                    .await;
                self.observer
                    .evicted(report.evicted.len(), report.bytes_freed);
                leader.complete(FlightOutcome::Completed);
                let elapsed = started.elapsed();
                self.observer
                    .download_finished(key.as_str(), elapsed, written);
                info!(
                    key = %key,
                    bytes = written,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "clip cached"
                );
            }
            Err(err) => {
                remove_partial(&part_path).await;
                self.observer.error(err.kind());
                let aborted = matches!(err, ServeError::Aborted);
                resolve_failed(leader, &key, &err);
                if !aborted {
                    tokio::select! {
                        _ = tx.send(Err(io::Error::other(err.to_string()))) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn copy_body(
        &self,
        body: &mut ByteStream,
        file: &mut BufWriter<File>,
        tx: &mpsc::Sender<io::Result<Bytes>>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServeError> {
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ServeError::Aborted),
                next = next_chunk(body, self.settings.idle_timeout) => next?,
            };
            let Some(chunk) = next else {
                return Ok(written);
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(Ok(chunk)) => sent.is_ok(),
            };
            if !delivered {
                return Err(ServeError::Aborted);
            }
        }
    }

    /// Periodically expire and trim the cache until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = this.retention.run_periodic_sweep().await;
                        this.observer.evicted(
                            report.evicted.len() + report.expired.len(),
                            report.bytes_freed,
                        );
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }
}

fn resolve_failed(leader: FlightLeader, key: &CacheKey, err: &ServeError) {
    match err {
        ServeError::Aborted => {
            info!(key = %key, "client disconnected; download discarded");
            leader.complete(FlightOutcome::Aborted);
        }
        err => {
            warn!(key = %key, kind = err.kind(), error = %err, "clip download failed");
            leader.complete(FlightOutcome::Failed(err.clone()));
        }
    }
}

async fn next_chunk(
    body: &mut ByteStream,
    idle: Option<Duration>,
) -> Result<Option<Bytes>, ServeError> {
    let next = match idle {
        Some(limit) => tokio::time::timeout(limit, body.next())
            .await
            .map_err(|_| ServeError::Timeout(limit))?,
        None => body.next().await,
    };
    next.transpose()
        .map_err(|err| ServeError::Upstream(format!("transfer interrupted: {err}")))
}

async fn finish_file(
    mut file: BufWriter<File>,
    part_path: &Path,
    final_path: &Path,
    expected: Option<u64>,
    written: u64,
) -> Result<(), ServeError> {
    if written == 0 {
        return Err(ServeError::Upstream("recorder sent an empty body".into()));
    }
    if let Some(expected) = expected {
        if expected != written {
            return Err(ServeError::Upstream(format!(
                "recorder sent {written} of {expected} bytes"
            )));
        }
    }
    file.flush().await?;
    file.get_mut().sync_all().await?;
    drop(file);
    fs::rename(part_path, final_path).await?;
    Ok(())
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial download"),
    }
}
