//! Retry logic with exponential backoff for transient control-plane errors.
//!
//! Only [`Conflict`](CloudError::Conflict) and
//! [`Throttled`](CloudError::Throttled) are retried. A throttling response
//! carrying a retry-after hint waits exactly that long; everything else
//! follows the configured backoff.

use crate::context::CancellationToken;
use crate::error::CloudError;
use crate::types::RetryConfig;
use std::time::Duration;

/// Callback trait for retry progress notifications.
pub trait RetryCallback: Sync {
    /// Called when an operation is being retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Wait before the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &CloudError, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &CloudError, _delay: Duration) {}
}

/// Callback that reports retries as warnings through the `log` facade.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &CloudError, delay: Duration) {
        log::warn!(
            "Attempt {}/{} failed: {}. Retrying in {}ms...",
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
    }
}

/// Execute an operation with retry logic.
///
/// Retries while the operation returns a retryable error, up to
/// `config.max_attempts` attempts in total. Cancellation is checked before
/// every retry and during the wait; once raised, the last error is returned.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, CloudError>
where
    F: FnMut() -> Result<T, CloudError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match operation() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt + 1 >= max_attempts || cancel.is_cancelled() {
            return Err(error);
        }

        let delay = error
            .retry_after()
            .unwrap_or_else(|| config.delay_for_attempt(attempt));

        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &error, delay);
        }

        if !cancel.sleep(delay) {
            log::debug!("Retry abandoned after cancellation: {}", error);
            return Err(error);
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    fn conflict() -> CloudError {
        CloudError::Conflict {
            path: "/firewallPolicies/p".into(),
            message: "another operation is in progress".into(),
        }
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(&RetryConfig::no_retry(), &CancellationToken::new(), None, || {
            Ok::<_, CloudError>(42)
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_non_retryable_error_fails_immediately() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancellationToken::new(), None, || {
            attempts.set(attempts.get() + 1);
            Err(CloudError::ValidationRejected {
                path: "/a".into(),
                message: "bad sku".into(),
            })
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_conflict_eventually_succeeds() {
        let attempts = Cell::new(0);
        let result = with_retry(&fast(), &CancellationToken::new(), None, || {
            let current = attempts.get();
            attempts.set(current + 1);
            if current < 2 { Err(conflict()) } else { Ok(42) }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancellationToken::new(), None, || {
            attempts.set(attempts.get() + 1);
            Err(conflict())
        });

        assert_eq!(result.unwrap_err(), conflict());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_throttle_hint_overrides_backoff() {
        struct Capture(std::sync::Mutex<Vec<Duration>>);
        impl RetryCallback for Capture {
            fn on_retry(&self, _: u32, _: u32, _: &CloudError, delay: Duration) {
                self.0.lock().unwrap().push(delay);
            }
        }

        let capture = Capture(std::sync::Mutex::new(Vec::new()));
        let attempts = Cell::new(0);
        let _: Result<(), _> = with_retry(&fast(), &CancellationToken::new(), Some(&capture), || {
            attempts.set(attempts.get() + 1);
            if attempts.get() == 1 {
                Err(CloudError::Throttled {
                    path: "/a".into(),
                    retry_after: Some(Duration::from_millis(20)),
                })
            } else {
                Err(conflict())
            }
        });

        let delays = capture.0.lock().unwrap().clone();
        assert_eq!(delays, vec![Duration::from_millis(20), Duration::from_millis(1)]);
    }

    #[test]
    fn test_cancel_stops_retrying() {
        let token = CancellationToken::new();
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &token, None, || {
            attempts.set(attempts.get() + 1);
            token.cancel();
            Err(conflict())
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &CloudError, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(count.clone());
        let _: Result<(), _> = with_retry(&fast(), &CancellationToken::new(), Some(&callback), || {
            Err(conflict())
        });

        // Not after the last attempt
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
