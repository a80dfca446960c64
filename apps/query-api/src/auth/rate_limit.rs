use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(15 * 60);

/// Per-key windowed buckets. The deny path never debits the bucket, so a
/// storm of rejected requests cannot push the reset time out.
pub struct RateLimiter {
    window: Duration,
    buckets: RwLock<HashMap<Uuid, Arc<Bucket>>>,
}

struct Bucket {
    used: AtomicU64,
    window_start: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_after: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_window(WINDOW)
    }
}

impl RateLimiter {
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn check(&self, key_id: Uuid, quota: Option<u64>) -> RateDecision {
        let Some(quota) = quota else {
            return RateDecision {
                allowed: true,
                limit: None,
                remaining: None,
                reset_after: self.window,
            };
        };

        let bucket = self.bucket_for(key_id);

        let reset_after = {
            let mut window_start = bucket.window_start.lock().expect("bucket lock");
            let elapsed = window_start.elapsed();
            if elapsed >= self.window {
                *window_start = Instant::now();
                bucket.used.store(0, Ordering::SeqCst);
                self.window
            } else {
                self.window - elapsed
            }
        };

        // Debit only when the request is admitted.
        loop {
            let used = bucket.used.load(Ordering::SeqCst);
            if used >= quota {
                return RateDecision {
                    allowed: false,
                    limit: Some(quota),
                    remaining: Some(0),
                    reset_after,
                };
            }
            if bucket
                .used
                .compare_exchange(used, used + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return RateDecision {
                    allowed: true,
                    limit: Some(quota),
                    remaining: Some(quota - used - 1),
                    reset_after,
                };
            }
        }
    }

    fn bucket_for(&self, key_id: Uuid) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().expect("limiter lock").get(&key_id) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().expect("limiter lock");
        buckets
            .entry(key_id)
            .or_insert_with(|| {
                Arc::new(Bucket {
                    used: AtomicU64::new(0),
                    window_start: Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// Periodic sweep dropping buckets that sat out a full window.
    pub fn start_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = self.window * 2;
                        let mut buckets = self.buckets.write().expect("limiter lock");
                        buckets.retain(|_, bucket| {
                            bucket
                                .window_start
                                .lock()
                                .expect("bucket lock")
                                .elapsed()
                                < cutoff
                        });
                    }
                }
            }
        });
    }
}
