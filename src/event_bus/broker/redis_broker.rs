use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, BrokerMessage};

/// Live connections, opened and dropped together
struct Connections {
    command: MultiplexedConnection,
    publisher: MultiplexedConnection,
    subscriber: Mutex<PubSubSink>,
    /// Forwards the subscriber stream into the inbox
    pump: JoinHandle<()>,
}

/// Redis-backed broker
pub struct RedisBroker {
    client: redis::Client,
    connect_timeout: Duration,
    response_timeout: Duration,
    connections: RwLock<Option<Connections>>,
}

impl RedisBroker {
    /// Parses the url; no connection is made until `connect`.
    pub fn new(url: &str, connect_timeout: Duration, response_timeout: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connect_timeout,
            response_timeout,
            connections: RwLock::new(None),
        })
    }

    async fn open(&self, inbox: mpsc::UnboundedSender<BrokerMessage>) -> Result<Connections, BrokerError> {
        let command = self
            .client
            .get_multiplexed_async_connection_with_timeouts(self.response_timeout, self.connect_timeout)
            .await?;
        let publisher = self
            .client
            .get_multiplexed_async_connection_with_timeouts(self.response_timeout, self.connect_timeout)
            .await?;
        let (subscriber, mut stream) = self.client.get_async_pubsub().await?.split();

        let pump = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if inbox.send(BrokerMessage { channel, payload }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "dropping non-text redis message");
                    }
                }
            }
            // Dropping the inbox sender tells the bus its channels are gone
            warn!("redis subscriber stream closed");
        });

        Ok(Connections {
            command,
            publisher,
            subscriber: Mutex::new(subscriber),
            pump,
        })
    }

    async fn command(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.command.clone())
            .ok_or(BrokerError::NotConnected)
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.publisher.clone())
            .ok_or(BrokerError::NotConnected)
    }

    /// The pub/sub sink has no response timeout of its own
    async fn on_subscriber(&self, channel: &str, subscribe: bool) -> Result<(), BrokerError> {
        let connections = self.connections.read().await;
        let connections = connections.as_ref().ok_or(BrokerError::NotConnected)?;
        let mut sink = connections.subscriber.lock().await;
        let request = async {
            if subscribe {
                sink.subscribe(channel).await
            } else {
                sink.unsubscribe(channel).await
            }
        };
        tokio::time::timeout(self.response_timeout, request)
            .await
            .map_err(|_| BrokerError::Timeout(self.response_timeout))??;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self, inbox: mpsc::UnboundedSender<BrokerMessage>) -> Result<(), BrokerError> {
        let connections = tokio::time::timeout(self.connect_timeout, self.open(inbox))
            .await
            .map_err(|_| BrokerError::Timeout(self.connect_timeout))??;

        if let Some(previous) = self.connections.write().await.replace(connections) {
            previous.pump.abort();
        }

        info!(
            addr = ?self.client.get_connection_info().addr,
            "redis command, publisher and subscriber connections established"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(connections) = self.connections.write().await.take() {
            connections.pump.abort();
            info!("redis connections closed");
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, receivers = receivers, "published to redis channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.on_subscriber(channel, true).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.on_subscriber(channel, false).await
    }

    async fn push_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        // LTRIM key 0 -1 would keep everything
        if max_len == 0 {
            return Ok(());
        }
        let mut conn = self.command().await?;
        let stop = max_len as isize - 1;
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let _: () = redis::pipe()
            .atomic()
            .lpush(key, payload)
            .ignore()
            .ltrim(key, 0, stop)
            .ignore()
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_list(&self, key: &str, limit: usize) -> Result<Vec<String>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.command().await?;
        let items: Vec<String> = conn.lrange(key, 0, limit as isize - 1).await?;
        Ok(items)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.command().await?;
        let keys: Vec<String> = conn
            .scan_match::<_, String>(format!("{}*", prefix))
            .await?
            .collect()
            .await;
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.command().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
