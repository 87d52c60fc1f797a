//! Predicate-driven retry loop with exponential backoff, shared by the
//! nvme connect path and other shell-outs that fail transiently.

use std::{future::Future, time::Duration};

use crate::error::DeviceError;

pub(crate) struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Human readable operation name for log lines.
    pub operation: String,
}

/// Loop `operation` until it succeeds, the error stops being retryable, or
/// `max_attempts` is exhausted. The backoff grows by `backoff_multiplier`
/// and is capped at `max_backoff`.
pub(crate) async fn with_retry<T, F, Fut, P>(
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeviceError>>,
    P: Fn(&DeviceError) -> bool,
{
    let mut backoff = config.initial_backoff;
    let mut last_error: Option<DeviceError> = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(
                        "{} succeeded on attempt {}/{}",
                        config.operation, attempt, config.max_attempts
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if !retryable(&error) {
                    return Err(error);
                }
                warn!(
                    "{} attempt {}/{} failed: {}",
                    config.operation, attempt, config.max_attempts, error
                );
                last_error = Some(error);
            }
        }
        if attempt < config.max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_backoff.as_secs_f64()),
            );
        }
    }

    Err(last_error.unwrap_or_else(|| {
        DeviceError::from(format!(
            "{} failed after {} attempts",
            config.operation, config.max_attempts
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            operation: "unit-test".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&config(6), |_| true, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DeviceError::new("connection refused"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(
            &config(6),
            |error| error.message.contains("transient"),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DeviceError::new("permanent failure"))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&config(4), |_| true, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DeviceError::new("still failing"))
            }
        })
        .await;
        assert!(result.unwrap_err().message.contains("still failing"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
