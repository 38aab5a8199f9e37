//! Publish/subscribe contract consumed by every component.
//!
//! ```text
//! signal.raw ──► gate ──► signal.accepted ──► (execution) ──► trade.result ──► risk
//!                  └────► signal.rejected                      profit.event ──► router ──► profit.{reinvest,buffer,withdraw}
//! commander ──► risk.override, audit.append          risk ──► risk.state
//! ```
//!
//! Delivery is at-least-once and in order per topic and publisher. Nothing
//! is guaranteed across topics.

pub mod memory;
pub mod retry;
pub mod topics;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;

use crate::error::ControlError;
use retry::{publish_with_retry, RetryConfig};

pub use memory::MemoryBus;
pub use topics::{Topic, Topics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type BusStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError>;

    /// `pattern` is an exact topic name or a prefix ending in `*`.
    async fn subscribe(&self, pattern: &str) -> Result<BusStream, ControlError>;
}

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

/// Serialize `value` as JSON and publish with bounded retry. Exhausted retries
/// end in the dead-letter path and surface as `BusUnavailable`.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn Bus,
    retry: &RetryConfig,
    topic: &str,
    value: &T,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(value).map_err(|e| ControlError::MalformedInput(e.to_string()))?;
    publish_with_retry(bus, retry, topic, payload).await
}
