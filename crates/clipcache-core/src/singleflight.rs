use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::ServeError;

/// How an in-flight download ended, as seen by the requests that joined it.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// The clip is on disk under its final name.
    Completed,
    /// The originating client went away; nothing was cached.
    Aborted,
    Failed(ServeError),
}

struct FlightEntry {
    id: u64,
    outcome: watch::Receiver<Option<FlightOutcome>>,
}

#[derive(Default)]
struct RegistryInner {
    flights: Mutex<HashMap<String, FlightEntry>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn release(&self, key: &str, id: u64) {
        let mut map = self.flights.lock().expect("download registry lock poisoned");
        if map.get(key).map(|entry| entry.id == id).unwrap_or(false) {
            map.remove(key);
        }
    }
}

/// At most one download per cache key. Registration is synchronous so two
/// requests racing for the same key always observe a single leader.
#[derive(Clone, Default)]
pub struct DownloadRegistry {
    inner: Arc<RegistryInner>,
}

pub enum Flight {
    Leader(FlightLeader),
    Follower(FlightFollower),
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, key: &str) -> Flight {
        let mut map = self
            .inner
            .flights
            .lock()
            .expect("download registry lock poisoned");
        if let Some(entry) = map.get(key) {
            return Flight::Follower(FlightFollower {
                outcome: entry.outcome.clone(),
            });
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        map.insert(key.to_string(), FlightEntry { id, outcome: rx });
        Flight::Leader(FlightLeader {
            registry: Arc::clone(&self.inner),
            key: key.to_string(),
            id,
            tx: Some(tx),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .flights
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.flights.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Owner of a registry entry. Dropping it without calling
/// [`FlightLeader::complete`] resolves the flight as [`FlightOutcome::Aborted`].
pub struct FlightLeader {
    registry: Arc<RegistryInner>,
    key: String,
    id: u64,
    tx: Option<watch::Sender<Option<FlightOutcome>>>,
}

impl FlightLeader {
    pub fn complete(mut self, outcome: FlightOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Unregister first so requests arriving from here on start fresh.
        self.registry.release(&self.key, self.id);
        tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        self.finish(FlightOutcome::Aborted);
    }
}

pub struct FlightFollower {
    outcome: watch::Receiver<Option<FlightOutcome>>,
}

impl FlightFollower {
    pub async fn wait(mut self) -> FlightOutcome {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(FlightOutcome::Aborted)
    }
}
