mod memory;
mod redis_broker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use self::memory::MemoryBroker;
pub use self::redis_broker::RedisBroker;

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("broker not connected")]
    NotConnected,

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Pub/sub broker seam
///
/// An implementation owns three logical connections:
/// - command: history reads/writes and health pings
/// - publisher: channel broadcasts
/// - subscriber: channel (un)subscription and the incoming message stream
///
/// `connect` opens all three together and forwards every message received on
/// a subscribed channel into `inbox`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, inbox: mpsc::UnboundedSender<BrokerMessage>) -> Result<(), BrokerError>;

    /// Close all connections (no-op when not connected)
    async fn disconnect(&self);

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Push to the front of a capped list, trim to `max_len` and reset its TTL
    async fn push_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Newest-first entries of a list
    async fn read_list(&self, key: &str, limit: usize) -> Result<Vec<String>, BrokerError>;

    /// Keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    /// Round-trip ping on the command connection
    async fn ping(&self) -> Result<(), BrokerError>;
}
