use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::errors::{OracleError, OracleResult};

#[derive(Debug)]
struct BreakerState {
    failure_count: u32,
    last_failure: Option<Instant>,
    is_open: bool,
}

/// Circuit breaker wrapping source fetches.
///
/// Closed -> Open after `failure_threshold` consecutive failures;
/// Open -> Closed once `reset_timeout` passes without attempts. While open,
/// calls fail immediately with `CircuitOpen`, which is never counted toward
/// the breaker itself.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(300))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: Mutex::new(BreakerState {
                failure_count: 0,
                last_failure: None,
                is_open: false,
            }),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open
    }

    /// Execute an operation under the breaker.
    pub async fn guard<T, F, Fut>(&self, source_id: &str, operation: F) -> OracleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        {
            let mut state = self.state.lock().await;
            if state.is_open {
                let cooled_down = state
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if cooled_down {
                    state.is_open = false;
                    state.failure_count = 0;
                } else {
                    return Err(OracleError::CircuitOpen(source_id.to_string()));
                }
            }
        }

        match operation().await {
            Ok(value) => {
                let mut state = self.state.lock().await;
                state.failure_count = 0;
                Ok(value)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                state.failure_count += 1;
                state.last_failure = Some(Instant::now());
                if state.failure_count >= self.failure_threshold {
                    state.is_open = true;
                    warn!(
                        "Circuit breaker opened for {} after {} consecutive failures",
                        source_id, state.failure_count
                    );
                }
                Err(err)
            }
        }
    }
}
