use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps simultaneous transfers against the recorder. Waiters are admitted in
/// arrival order (tokio's semaphore is fair). There is no timeout here; callers
/// that need one race [`DownloadLimiter::acquire`] against their own deadline.
#[derive(Clone)]
pub struct DownloadLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

/// Held for the duration of one transfer; the slot is released on drop.
#[derive(Debug)]
pub struct DownloadSlot {
    _permit: OwnedSemaphorePermit,
}

impl DownloadLimiter {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub async fn acquire(&self) -> DownloadSlot {
        // The semaphore is never closed, so acquisition cannot fail.
        match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => DownloadSlot { _permit: permit },
            Err(_) => unreachable!("download limiter semaphore closed"),
        }
    }

    pub fn try_acquire(&self) -> Option<DownloadSlot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| DownloadSlot { _permit: permit })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.slots.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrency_and_releases_on_drop() {
        let limiter = DownloadLimiter::new(2);
        let a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        assert_eq!(limiter.in_use(), 2);
        assert!(limiter.try_acquire().is_none());
        drop(a);
        assert_eq!(limiter.in_use(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let limiter = DownloadLimiter::new(1);
        let held = limiter.acquire().await;
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = std::sync::Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _slot = limiter.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one is spawned.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_is_clamped_to_one_slot() {
        let limiter = DownloadLimiter::new(0);
        assert_eq!(limiter.max(), 1);
    }
}
