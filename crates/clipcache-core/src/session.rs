use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::upstream::{NvrApi, UpstreamError};

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// One shared recorder session. The refresh runs while the slot lock is held,
/// so callers arriving during a login wait for it instead of logging in again.
pub struct SessionCache {
    api: Arc<dyn NvrApi>,
    ttl: Duration,
    slot: Mutex<Option<CachedToken>>,
    logins: AtomicU64,
}

impl SessionCache {
    pub fn new(api: Arc<dyn NvrApi>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            slot: Mutex::new(None),
            logins: AtomicU64::new(0),
        }
    }

    pub async fn get_token(&self) -> Result<String, UpstreamError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
            debug!("recorder session expired; logging in again");
        }
        let fresh = self.api.login().await?;
        self.logins.fetch_add(1, Ordering::Relaxed);
        info!(ttl_secs = self.ttl.as_secs(), "recorder session established");
        let token = fresh.token.clone();
        *slot = Some(CachedToken {
            token: fresh.token,
            expires_at: Instant::now() + self.ttl,
        });
        Ok(token)
    }

    /// Drop the cached token, e.g. after the recorder rejected it.
    pub async fn invalidate(&self) {
        if self.slot.lock().await.take().is_some() {
            debug!("recorder session invalidated");
        }
    }

    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }
}
