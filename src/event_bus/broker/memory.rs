use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Broker, BrokerError, BrokerMessage};

struct ClientState {
    /// None once the subscriber side was dropped
    inbox: Option<mpsc::UnboundedSender<BrokerMessage>>,
    channels: HashSet<String>,
}

struct CappedList {
    items: VecDeque<String>,
    expires_at: Instant,
}

struct HubState {
    reachable: bool,
    reject_publishes: bool,
    stalled: bool,
    clients: HashMap<Uuid, ClientState>,
    lists: HashMap<String, CappedList>,
}

impl HubState {
    fn check(&self, client_id: &Uuid) -> Result<(), BrokerError> {
        if !self.reachable {
            return Err(BrokerError::Unreachable("memory broker is offline".to_string()));
        }
        if !self.clients.contains_key(client_id) {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.lists.retain(|_, list| list.expires_at > now);
    }
}

/// In-process broker with Redis pub/sub and capped-list semantics
///
/// Every `MemoryBroker` is one client; `peer()` creates another client on the
/// same hub, standing in for a second process. `set_reachable(false)` simulates
/// an outage: all clients are dropped and every call fails until it is restored.
#[derive(Clone)]
pub struct MemoryBroker {
    hub: Arc<Mutex<HubState>>,
    client_id: Uuid,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(HubState {
                reachable: true,
                reject_publishes: false,
                stalled: false,
                clients: HashMap::new(),
                lists: HashMap::new(),
            })),
            client_id: Uuid::new_v4(),
        }
    }

    /// A new client sharing this hub
    pub fn peer(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            client_id: Uuid::new_v4(),
        }
    }

    pub async fn set_reachable(&self, reachable: bool) {
        let mut hub = self.hub.lock().await;
        hub.reachable = reachable;
        if !reachable {
            hub.clients.clear();
        }
    }

    /// Fail channel broadcasts only; lists and pings keep working
    pub async fn reject_publishes(&self, reject: bool) {
        self.hub.lock().await.reject_publishes = reject;
    }

    /// Drop this client's subscriber side, as when a server kills only that
    /// connection. Commands keep working.
    pub async fn drop_subscriber(&self) {
        let mut hub = self.hub.lock().await;
        if let Some(client) = hub.clients.get_mut(&self.client_id) {
            client.inbox = None;
            client.channels.clear();
        }
    }

    /// Accept commands but never answer them, like a black-holed server.
    /// Connecting and disconnecting are unaffected.
    pub async fn set_stalled(&self, stalled: bool) {
        self.hub.lock().await.stalled = stalled;
    }

    async fn stall_if_requested(&self) {
        let stalled = self.hub.lock().await.stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    pub async fn is_reachable(&self) -> bool {
        self.hub.lock().await.reachable
    }

    /// Number of clients subscribed to a channel
    pub async fn channel_subscribers(&self, channel: &str) -> usize {
        let hub = self.hub.lock().await;
        hub.clients
            .values()
            .filter(|c| c.channels.contains(channel))
            .count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, inbox: mpsc::UnboundedSender<BrokerMessage>) -> Result<(), BrokerError> {
        let mut hub = self.hub.lock().await;
        if !hub.reachable {
            return Err(BrokerError::Unreachable("memory broker is offline".to_string()));
        }
        hub.clients.insert(
            self.client_id,
            ClientState {
                inbox: Some(inbox),
                channels: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.hub.lock().await.clients.remove(&self.client_id);
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.stall_if_requested().await;
        let hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        if hub.reject_publishes {
            return Err(BrokerError::Unreachable("publish rejected".to_string()));
        }

        let inboxes = hub
            .clients
            .values()
            .filter(|c| c.channels.contains(channel))
            .filter_map(|c| c.inbox.as_ref());
        for inbox in inboxes {
            // Closed inboxes belong to clients that are shutting down
            let _ = inbox.send(BrokerMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.stall_if_requested().await;
        let mut hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        match hub.clients.get_mut(&self.client_id) {
            Some(ClientState { inbox: Some(_), channels }) => {
                channels.insert(channel.to_string());
                Ok(())
            }
            _ => Err(BrokerError::NotConnected),
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.stall_if_requested().await;
        let mut hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        if let Some(client) = hub.clients.get_mut(&self.client_id) {
            client.channels.remove(channel);
        }
        Ok(())
    }

    async fn push_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.stall_if_requested().await;
        let mut hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        hub.purge_expired();
        if max_len == 0 {
            return Ok(());
        }

        let expires_at = Instant::now() + ttl;
        let list = hub.lists.entry(key.to_string()).or_insert_with(|| CappedList {
            items: VecDeque::new(),
            expires_at,
        });
        list.items.push_front(payload.to_string());
        list.items.truncate(max_len);
        list.expires_at = expires_at;
        Ok(())
    }

    async fn read_list(&self, key: &str, limit: usize) -> Result<Vec<String>, BrokerError> {
        self.stall_if_requested().await;
        let mut hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        hub.purge_expired();

        Ok(hub
            .lists
            .get(key)
            .map(|list| list.items.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        self.stall_if_requested().await;
        let mut hub = self.hub.lock().await;
        hub.check(&self.client_id)?;
        hub.purge_expired();

        Ok(hub
            .lists
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.stall_if_requested().await;
        self.hub.lock().await.check(&self.client_id)
    }
}
