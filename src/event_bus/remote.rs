use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerError, BrokerMessage, RedisBroker};
use super::handler::{dispatch, Delivery, EventHandler, Registration, SharedHandler};
use super::types::{Event, SubscriptionId};
use crate::error::{EventBusError, Result};

/// Remote history lists are keyed `eventbus:history:<kind>`
pub const HISTORY_KEY_PREFIX: &str = "eventbus:history:";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

pub fn history_key(kind: &str) -> String {
    format!("{}{}", HISTORY_KEY_PREFIX, kind)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Full connection url; takes precedence over host/port
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    /// Connection attempts before the bus is marked disconnected
    pub max_retries: u32,
    /// Base delay between attempts, grows linearly per attempt
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on any single broker command once connected
    pub response_timeout: Duration,
    pub event_ttl: Duration,
    pub enable_event_history: bool,
    pub max_history_size: usize,
    /// Stamped into the metadata of every event this instance broadcasts
    pub instance_id: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: 6379,
            password: None,
            database: 0,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(3),
            event_ttl: Duration::from_secs(3600),
            enable_event_history: true,
            max_history_size: 1000,
            instance_id: format!("eventbus-{}", Uuid::new_v4()),
        }
    }
}

impl RemoteConfig {
    /// Resolve `url`, or build one from host/port/password/database
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }

        let host = self
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| EventBusError::configuration("remote transport requires a url or host"))?;

        let auth = match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(":{}@", password),
            _ => String::new(),
        };

        Ok(format!("redis://{}{}:{}/{}", auth, host, self.port, self.database))
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        (self.retry_delay * attempt).min(MAX_RETRY_DELAY)
    }
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed by `disconnect`; only an explicit `connect` reopens it
    Closed,
}

/// Result of a round-trip health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHealth {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteHealth {
    fn failed(error: impl ToString) -> Self {
        Self {
            connected: false,
            latency_ms: None,
            error: Some(error.to_string()),
        }
    }
}

/// What happened to a remote publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteOutcome {
    /// Written to history and broadcast on the channel
    Broadcast,
    /// Broker failed; delivered to this instance's own handlers instead
    FellBack { reason: String, delivery: Delivery },
}

impl RemoteOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, RemoteOutcome::FellBack { .. })
    }
}

// ============================================================================
// RemoteBus
// ============================================================================

#[derive(Default)]
struct SubscriberTable {
    /// kind (= channel) -> registrations; the length is the channel's reference count
    by_kind: HashMap<String, Vec<Registration>>,
    kinds: HashMap<SubscriptionId, String>,
}

struct RemoteInner {
    config: RemoteConfig,
    broker: Arc<dyn Broker>,
    state: RwLock<ConnectionState>,
    table: RwLock<SubscriberTable>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per connection attempt and on disconnect; a pump only reports
    /// the loss of its own stream
    epoch: AtomicU64,
    /// Serializes connect/reconnect/disconnect
    lifecycle: Mutex<()>,
}

/// Distributed event bus over a pub/sub broker
///
/// Channel name = event kind. Broker failures never reach the caller: the bus
/// marks itself disconnected and delivers to its own handlers instead, until a
/// health check reconnects it.
#[derive(Clone)]
pub struct RemoteBus {
    inner: Arc<RemoteInner>,
}

impl RemoteBus {
    pub fn new(config: RemoteConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                config,
                broker,
                state: RwLock::new(ConnectionState::Disconnected),
                table: RwLock::new(SubscriberTable::default()),
                pump: Mutex::new(None),
                epoch: AtomicU64::new(0),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Build a Redis-backed bus (no connection is made yet)
    pub fn redis(config: RemoteConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let broker = RedisBroker::new(&url, config.connect_timeout, config.response_timeout)?;
        Ok(Self::new(config, Arc::new(broker)))
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open the broker connections, retrying with increasing delay
    ///
    /// After the last failed attempt the bus stays disconnected and the error is
    /// returned; later calls degrade instead of failing.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        *self.inner.state.write().await = ConnectionState::Connecting;

        let attempts = self.inner.config.attempts();
        let mut last_error = BrokerError::NotConnected;

        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(()) => {
                    info!(
                        attempt = attempt,
                        instance_id = %self.inner.config.instance_id,
                        "remote event bus connected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "remote event bus connection attempt failed"
                    );
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.retry_delay(attempt)).await;
                    }
                }
            }
        }

        *self.inner.state.write().await = ConnectionState::Disconnected;
        error!(
            attempts = attempts,
            error = %last_error,
            "remote event bus unreachable, giving up"
        );
        Err(last_error.into())
    }

    /// One connect attempt: open connections, start the message pump and
    /// restore every channel that still has handlers.
    async fn try_connect(&self) -> std::result::Result<(), BrokerError> {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.broker.connect(tx).await?;
        self.start_pump(rx, epoch).await;

        let table = self.inner.table.read().await;
        for kind in table.by_kind.keys() {
            if let Err(e) = self.bounded(self.inner.broker.subscribe(kind)).await {
                self.inner.broker.disconnect().await;
                return Err(e);
            }
        }
        if !table.by_kind.is_empty() {
            debug!(channels = table.by_kind.len(), "restored remote channel subscriptions");
        }
        drop(table);

        *self.inner.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    async fn reconnect_once(&self) -> std::result::Result<(), BrokerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.connection_state().await {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(BrokerError::NotConnected),
            _ => {}
        }
        let result = self.try_connect().await;
        match &result {
            Ok(()) => info!("remote event bus reconnected"),
            Err(e) => debug!(error = %e, "remote event bus still unreachable"),
        }
        result
    }

    /// Close all broker connections. Handlers stay registered and their
    /// channels are restored on the next `connect`; health checks do not
    /// reopen a closed bus.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.broker.disconnect().await;
        if let Some(pump) = self.inner.pump.lock().await.take() {
            pump.abort();
        }
        *self.inner.state.write().await = ConnectionState::Closed;
        info!("remote event bus disconnected");
    }

    async fn mark_disconnected(&self, cause: &BrokerError) {
        let mut state = self.inner.state.write().await;
        match *state {
            ConnectionState::Closed => return,
            ConnectionState::Connected => warn!(error = %cause, "remote event bus marked disconnected"),
            _ => {}
        }
        *state = ConnectionState::Disconnected;
    }

    /// Subscriber stream ended on its own: the channels are gone even if
    /// commands still succeed
    async fn stream_lost(&self, epoch: u64) {
        let mut state = self.inner.state.write().await;
        if self.inner.epoch.load(Ordering::SeqCst) != epoch || *state != ConnectionState::Connected {
            return;
        }
        warn!("remote subscriber stream closed, marking remote event bus disconnected");
        *state = ConnectionState::Disconnected;
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = std::result::Result<T, BrokerError>>,
    ) -> std::result::Result<T, BrokerError> {
        let limit = self.inner.config.response_timeout;
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(limit)),
        }
    }

    async fn start_pump(&self, mut rx: mpsc::UnboundedReceiver<BrokerMessage>, epoch: u64) {
        // Weak so a forgotten bus is not kept alive by its own pump
        let weak: Weak<RemoteInner> = Arc::downgrade(&self.inner);

        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let bus = RemoteBus { inner };
                tokio::spawn(async move { bus.handle_message(message).await });
            }
            if let Some(inner) = weak.upgrade() {
                RemoteBus { inner }.stream_lost(epoch).await;
            }
        });

        if let Some(previous) = self.inner.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    async fn handle_message(&self, message: BrokerMessage) {
        let event = match Event::from_json(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    channel = %message.channel,
                    error = %e,
                    "dropping malformed remote event"
                );
                return;
            }
        };

        if event.kind != message.channel {
            warn!(
                channel = %message.channel,
                kind = %event.kind,
                "remote event kind does not match its channel"
            );
        }

        let snapshot = {
            let table = self.inner.table.read().await;
            table.by_kind.get(&message.channel).cloned().unwrap_or_default()
        };

        let delivery = dispatch(&event, snapshot).await;
        self.report_failures(&event, &delivery);
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn subscribe<H: EventHandler>(&self, kind: impl Into<String>, handler: H) -> SubscriptionId {
        self.subscribe_shared(kind, Arc::new(handler)).await
    }

    /// Register a handler; the first handler for a kind subscribes its channel
    pub async fn subscribe_shared(&self, kind: impl Into<String>, handler: SharedHandler) -> SubscriptionId {
        let kind = kind.into();
        let id = SubscriptionId::remote();

        // Held across the broker call so channel (un)subscribes stay ordered
        let mut table = self.inner.table.write().await;
        let registrations = table.by_kind.entry(kind.clone()).or_default();
        registrations.push(Registration { id, handler });
        let first = registrations.len() == 1;
        table.kinds.insert(id, kind.clone());

        if first && self.is_connected().await {
            match self.bounded(self.inner.broker.subscribe(&kind)).await {
                Ok(()) => debug!(channel = %kind, "subscribed to remote channel"),
                Err(e) => {
                    warn!(channel = %kind, error = %e, "remote channel subscribe failed");
                    self.mark_disconnected(&e).await;
                }
            }
        }

        debug!(kind = %kind, subscription_id = %id, "remote subscription added");
        id
    }

    /// Revoke a subscription; the last handler for a kind unsubscribes its channel
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut table = self.inner.table.write().await;

        let Some(kind) = table.kinds.remove(id) else {
            return false;
        };

        let mut last = false;
        if let Some(registrations) = table.by_kind.get_mut(&kind) {
            registrations.retain(|r| r.id != *id);
            if registrations.is_empty() {
                table.by_kind.remove(&kind);
                last = true;
            }
        }

        if last && self.is_connected().await {
            match self.bounded(self.inner.broker.unsubscribe(&kind)).await {
                Ok(()) => debug!(channel = %kind, "unsubscribed from remote channel"),
                Err(e) => {
                    warn!(channel = %kind, error = %e, "remote channel unsubscribe failed");
                    self.mark_disconnected(&e).await;
                }
            }
        }

        debug!(kind = %kind, subscription_id = %id, "remote subscription removed");
        true
    }

    pub async fn is_subscribed(&self, id: &SubscriptionId) -> bool {
        self.inner.table.read().await.kinds.contains_key(id)
    }

    pub async fn get_subscription_stats(&self) -> HashMap<String, usize> {
        let table = self.inner.table.read().await;
        table
            .by_kind
            .iter()
            .map(|(kind, registrations)| (kind.clone(), registrations.len()))
            .collect()
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish an event across processes
    ///
    /// This will:
    /// 1. Validate, assign identity and stamp this instance's provenance
    /// 2. Write the capped, TTL-refreshed history list for the kind
    /// 3. Broadcast on the kind's channel
    ///
    /// A broker failure in 2 or 3 falls back to this instance's own handlers.
    /// Only validation/serialization errors are returned.
    pub async fn publish(&self, mut event: Event) -> Result<RemoteOutcome> {
        event.validate()?;
        event.ensure_identity();
        event
            .metadata
            .instance_id
            .get_or_insert_with(|| self.inner.config.instance_id.clone());
        event.metadata.source.get_or_insert_with(|| "remote-bus".to_string());
        event.metadata.published_at.get_or_insert_with(chrono::Utc::now);

        let payload = event.to_json()?;

        if !self.is_connected().await {
            debug!(kind = %event.kind, "remote event bus disconnected, delivering locally");
            return Ok(self.fall_back(&event, "remote event bus disconnected").await);
        }

        match self.broadcast(&event, &payload).await {
            Ok(()) => {
                debug!(
                    kind = %event.kind,
                    correlation_id = %event.correlation_id,
                    "broadcast remote event"
                );
                Ok(RemoteOutcome::Broadcast)
            }
            Err(e) => {
                warn!(
                    kind = %event.kind,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "remote publish failed, delivering locally"
                );
                self.mark_disconnected(&e).await;
                Ok(self.fall_back(&event, e.to_string()).await)
            }
        }
    }

    async fn broadcast(&self, event: &Event, payload: &str) -> std::result::Result<(), BrokerError> {
        let config = &self.inner.config;

        // History first, so capture does not depend on the broadcast
        if config.enable_event_history && config.max_history_size > 0 {
            self.bounded(self.inner.broker.push_capped(
                &history_key(&event.kind),
                payload,
                config.max_history_size,
                config.event_ttl,
            ))
            .await?;
        }

        self.bounded(self.inner.broker.publish(&event.kind, payload)).await
    }

    async fn fall_back(&self, event: &Event, reason: impl Into<String>) -> RemoteOutcome {
        let snapshot = {
            let table = self.inner.table.read().await;
            table.by_kind.get(&event.kind).cloned().unwrap_or_default()
        };
        let delivery = dispatch(event, snapshot).await;
        self.report_failures(event, &delivery);

        RemoteOutcome::FellBack {
            reason: reason.into(),
            delivery,
        }
    }

    fn report_failures(&self, event: &Event, delivery: &Delivery) {
        for failure in &delivery.failures {
            error!(
                kind = %event.kind,
                correlation_id = %event.correlation_id,
                subscription_id = %failure.subscription_id,
                error = %failure.message,
                "remote event handler failed"
            );

            if event.is_error_event() {
                continue;
            }

            let error_event = Event::system_error(event, &failure.subscription_id, &failure.message);
            tokio::spawn(self.republish(error_event));
        }
    }

    fn republish(&self, event: Event) -> BoxFuture<'static, ()> {
        let bus = self.clone();
        Box::pin(async move {
            if let Err(e) = bus.publish(event).await {
                warn!(error = %e, "failed to publish system.error event");
            }
        })
    }

    // ========================================================================
    // History and health
    // ========================================================================

    /// Recent events from the capped history lists, newest first
    ///
    /// Without a kind, every history list is read and merged. Returns an empty
    /// list when disconnected or when history is disabled.
    pub async fn get_event_history(&self, kind: Option<&str>, limit: usize) -> Vec<Event> {
        let config = &self.inner.config;
        if !config.enable_event_history || config.max_history_size == 0 || limit == 0 {
            return Vec::new();
        }
        if !self.is_connected().await {
            debug!("remote event bus disconnected, no remote history");
            return Vec::new();
        }

        let keys = match kind {
            Some(kind) => vec![history_key(kind)],
            None => match self.bounded(self.inner.broker.keys(HISTORY_KEY_PREFIX)).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "failed to list remote history keys");
                    self.mark_disconnected(&e).await;
                    return Vec::new();
                }
            },
        };

        let mut events = Vec::new();
        for key in keys {
            match self.bounded(self.inner.broker.read_list(&key, limit)).await {
                Ok(items) => {
                    events.extend(items.iter().filter_map(|raw| match Event::from_json(raw) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(key = %key, error = %e, "skipping malformed history entry");
                            None
                        }
                    }));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read remote history");
                    self.mark_disconnected(&e).await;
                    break;
                }
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        events
    }

    /// Round-trip ping on the command connection
    ///
    /// When disconnected, one reconnect attempt is made first. A closed bus
    /// reports itself unhealthy without touching the broker.
    pub async fn health_check(&self) -> RemoteHealth {
        match self.connection_state().await {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return RemoteHealth::failed("remote event bus closed"),
            _ => {
                if let Err(e) = self.reconnect_once().await {
                    return RemoteHealth::failed(e);
                }
            }
        }

        let started = Instant::now();
        match self.bounded(self.inner.broker.ping()).await {
            Ok(()) => RemoteHealth {
                connected: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => {
                self.mark_disconnected(&e).await;
                RemoteHealth::failed(e)
            }
        }
    }
}
