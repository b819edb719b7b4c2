//! Backoff retry wrapper for worker requests.
//!
//! Retries are permitted only for the closed retryable set of error codes
//! (timeout, worker-unavailable, worker-failed), never after any streamed
//! bytes have been observed for the request, and never once the caller's
//! abort signal has fired.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

use strand_types::EngineError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay in `[delay/2, delay]` to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        if self.jitter && !exp.is_zero() {
            let micros = exp.as_micros() as u64;
            Duration::from_micros(rand::thread_rng().gen_range(micros / 2..=micros))
        } else {
            exp
        }
    }
}

/// Marks the moment any streamed bytes are observed for a request id. Once
/// set, the request is no longer safely retryable: the worker may already
/// have produced visible output.
#[derive(Debug, Clone, Default)]
pub struct StreamProgress {
    seen: Arc<AtomicBool>,
}

impl StreamProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.seen.store(true, Ordering::Release);
    }

    pub fn seen(&self) -> bool {
        self.seen.load(Ordering::Acquire)
    }
}

/// Run `op` with retries per `policy`.
///
/// `op` receives the zero-based attempt number. `progress`, when provided,
/// suppresses any further attempt once streamed output has been observed.
pub async fn retry_request<F, Fut, T>(
    policy: &RetryPolicy,
    mut cancel: Option<watch::Receiver<bool>>,
    progress: Option<&StreamProgress>,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = EngineError::Internal;

    for attempt in 0..attempts {
        if let Some(rx) = cancel.as_ref() {
            if *rx.borrow() {
                return Err(EngineError::Cancelled);
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let final_attempt = attempt + 1 == attempts;
                let streamed = progress.is_some_and(StreamProgress::seen);
                if !err.is_retryable() || streamed || final_attempt {
                    return Err(err);
                }
                debug!(attempt, error = %err, "retrying worker request");
                last_err = err;
            }
        }

        let delay = policy.delay_for(attempt);
        match cancel.as_mut() {
            Some(rx) => {
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                // Signal owner went away; keep sleeping.
                                sleep.as_mut().await;
                                break;
                            }
                            if *rx.borrow() {
                                return Err(EngineError::Cancelled);
                            }
                        }
                    }
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    Err(last_err)
}
