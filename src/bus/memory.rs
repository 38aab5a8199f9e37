use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{topic_matches, Bus, BusStream, Envelope};
use crate::error::ControlError;
use crate::logging::{log, obj, v_str, Domain, Level};

/// In-process bus on a tokio broadcast channel. Used by the single-process
/// runner and by tests; an external broker plugs in through the same trait.
#[derive(Debug)]
pub struct MemoryBus {
    tx: broadcast::Sender<Envelope>,
    available: AtomicBool,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx, available: AtomicBool::new(true), published: AtomicU64::new(0) }
    }

    /// Simulate an outage: publishes fail with `BusUnavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ControlError::BusUnavailable {
                topic: topic.to_string(),
                reason: "memory bus marked unavailable".to_string(),
            });
        }
        // No subscribers is not an error: the message is simply not observed.
        let _ = self.tx.send(Envelope { topic: topic.to_string(), payload });
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream, ControlError> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(env) => {
                            if topic_matches(&pattern, &env.topic) {
                                return Some((env, rx));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log(
                                Level::Warn,
                                Domain::Bus,
                                "subscriber_lagged",
                                obj(&[("pattern", v_str(&pattern)), ("skipped", json!(skipped))]),
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_publish_subscribe_filters_by_pattern() {
        let bus = MemoryBus::new(32);
        let mut profits = bus.subscribe("ns:profit.*").await.unwrap();
        bus.publish("ns:signal.raw", b"a".to_vec()).await.unwrap();
        bus.publish("ns:profit.buffer", b"b".to_vec()).await.unwrap();
        let env = profits.next().await.unwrap();
        assert_eq!(env.topic, "ns:profit.buffer");
        assert_eq!(env.payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_unavailable_bus_rejects_publish() {
        let bus = MemoryBus::new(32);
        bus.set_available(false);
        let err = bus.publish("t", vec![]).await.unwrap_err();
        assert!(matches!(err, ControlError::BusUnavailable { .. }));
        bus.set_available(true);
        assert!(bus.publish("t", vec![]).await.is_ok());
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_in_order_within_topic() {
        let bus = MemoryBus::new(64);
        let mut sub = bus.subscribe("t").await.unwrap();
        for i in 0..10u8 {
            bus.publish("t", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.next().await.unwrap().payload, vec![i]);
        }
    }
}
