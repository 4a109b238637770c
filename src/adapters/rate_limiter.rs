use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Sliding-window rate limiter for outbound source calls.
///
/// Permits `calls` requests per `period`; slots older than the period are
/// reclaimed on entry. The internal lock is held across the wait so callers
/// queue in FIFO order per adapter.
pub struct RateLimiter {
    calls: usize,
    period: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(calls: usize, period: Duration) -> Self {
        Self {
            calls: calls.max(1),
            period,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire permission to make one call, sleeping until a slot frees up.
    pub async fn acquire(&self) {
        let mut stamps = self.timestamps.lock().await;

        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.period {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.calls {
            if let Some(&oldest) = stamps.front() {
                let elapsed = oldest.elapsed();
                if elapsed < self.period {
                    sleep(self.period - elapsed).await;
                }
                stamps.pop_front();
            }
        }

        stamps.push_back(Instant::now());
    }
}
