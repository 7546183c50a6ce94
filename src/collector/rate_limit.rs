//! Request-based rate limiting shared by every worker of a collector.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::debug;

/// Sliding-window limiter: at most `max_requests` permits are out within any
/// `window`.
///
/// Each permit is held for the full window after it is acquired, then
/// released, so the semaphore is the single synchronised accessor for the
/// shared quota.
#[derive(Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max_requests` per `window` (minimum 1 request).
    pub fn request_based(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_requests)),
            max_requests,
            window,
        }
    }

    /// Allow `per_hour` requests per hour.
    pub fn per_hour(per_hour: usize) -> Self {
        Self::request_based(per_hour, Duration::from_secs(3600))
    }

    /// Configured quota
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a request slot.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        if self.semaphore.available_permits() == 0 {
            debug!(
                max_requests = self.max_requests,
                window_secs = self.window.as_secs_f64(),
                "Rate limit quota exhausted, waiting for a slot"
            );
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RateLimitError::AcquireError(e.to_string()))?;

        // The slot is returned once the window it was spent in has elapsed.
        let window = self.window;
        tokio::spawn(async move {
            sleep(window).await;
            drop(permit);
        });

        Ok(())
    }

    /// Stop handing out permits; pending and future acquires fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("available", &self.available())
            .finish()
    }
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Failed to acquire permits
    #[error("failed to acquire rate limit permits: {0}")]
    AcquireError(String),
}
