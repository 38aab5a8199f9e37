use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};

use super::Bus;
use crate::error::ControlError;
use crate::logging::{agg_increment, log, log_dead_letter, obj, v_str, Domain, Level};

static DEAD_LETTERS: AtomicU64 = AtomicU64::new(0);

/// Messages dropped after exhausting retries since process start.
pub fn dead_letter_count() -> u64 {
    DEAD_LETTERS.load(Ordering::SeqCst)
}

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts; for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self { max_retries, base_delay_ms: 0, max_delay_ms: 0, jitter_factor: 0.0 }
    }

    /// Exponential backoff with jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        // ±jitter_factor of the delay
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry a fallible async operation with exponential backoff
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    log(
                        Level::Warn,
                        Domain::Bus,
                        "retry",
                        obj(&[
                            ("operation", v_str(operation_name)),
                            ("attempt", json!(attempt + 1)),
                            ("max_attempts", json!(config.max_retries + 1)),
                            ("error", v_str(&e.to_string())),
                            ("delay_ms", json!(delay.as_millis() as u64)),
                        ]),
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("retry_async exhausted without error")))
}

/// Publish with bounded retry; after the last attempt the message goes to
/// the dead-letter path (logged and dropped) and `BusUnavailable` is returned.
pub async fn publish_with_retry(
    bus: &dyn Bus,
    config: &RetryConfig,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), ControlError> {
    let name = format!("publish:{}", topic);
    let result = retry_async(config, &name, || {
        let payload = payload.clone();
        async move { bus.publish(topic, payload).await.map_err(anyhow::Error::from) }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            DEAD_LETTERS.fetch_add(1, Ordering::SeqCst);
            agg_increment("dead_letter");
            log_dead_letter(topic, config.max_retries + 1, &err.to_string(), payload.len());
            Err(ControlError::BusUnavailable { topic: topic.to_string(), reason: err.to_string() })
        }
    }
}
