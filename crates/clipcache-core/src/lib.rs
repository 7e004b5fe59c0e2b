//! Cache-aside download coordinator for recorder clips.
//!
//! Requests name a clip by its cache key. A clip already on disk is served
//! directly; otherwise exactly one download per key runs against the recorder,
//! streaming to its client while it is persisted, and every concurrent request
//! for the same key waits for that download instead of starting its own.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod limiter;
pub mod locator;
pub mod nvr_http;
pub mod observer;
pub mod retention;
pub mod session;
pub mod singleflight;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use config::{load_effective, Config};
pub use coordinator::{
    ClipBody, ClipCoordinator, ClipResponse, ClipSource, ClipStream, CoordinatorParts,
    CoordinatorSettings, CoordinatorStats,
};
pub use error::ServeError;
pub use key::{CacheKey, KeyError};
pub use locator::{ClipLocator, LocateError, RemoteClipDescriptor};
pub use nvr_http::HttpNvr;
pub use observer::{CacheObserver, CacheStats, MetricsObserver, NoopObserver};
pub use retention::{CacheEntryMetadata, EvictionReport, RetentionManager, ScanReport};
pub use upstream::{ByteStream, NvrApi, UpstreamError};
