use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::broker::Broker;
use super::handler::{Deduplicated, Delivery, EventHandler, SharedHandler};
use super::local::{LocalBus, LocalBusConfig};
use super::remote::{RemoteBus, RemoteConfig, RemoteHealth, RemoteOutcome};
use super::types::{BusMode, Event, SubscriptionId, Transport};
use crate::error::{EventBusError, Result};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

// ============================================================================
// Configuration and options
// ============================================================================

#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub enable_remote: bool,
    /// Start in local-only mode when the remote transport is unreachable
    pub fallback_to_local: bool,
    pub remote: Option<RemoteConfig>,
    pub health_check_interval: Duration,
    pub local: LocalBusConfig,
    /// Correlation ids remembered per subscription spanning both transports
    pub dedup_window: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enable_remote: false,
            fallback_to_local: true,
            remote: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            local: LocalBusConfig::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval.is_zero() {
            return Err(EventBusError::configuration(
                "health_check_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    pub local_only: bool,
    pub remote_only: bool,
}

impl SubscribeOptions {
    pub fn local_only() -> Self {
        Self {
            local_only: true,
            remote_only: false,
        }
    }

    pub fn remote_only() -> Self {
        Self {
            local_only: false,
            remote_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    pub local_only: bool,
    pub remote_only: bool,
}

impl PublishOptions {
    pub fn local_only() -> Self {
        Self {
            local_only: true,
            remote_only: false,
        }
    }

    pub fn remote_only() -> Self {
        Self {
            local_only: false,
            remote_only: true,
        }
    }
}

/// Per-transport outcome of one hybrid publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub correlation_id: String,
    /// None when the local leg was not selected
    pub local: Option<Delivery>,
    /// None when the remote leg was not selected or raised an error
    pub remote: Option<RemoteOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_error: Option<String>,
    /// Set when the remote leg raised and the event was re-published locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_fallback: Option<Delivery>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySource {
    Local,
    Remote,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub local: HashMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<HashMap<String, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_health: Option<RemoteHealth>,
    pub mode: BusMode,
}

// ============================================================================
// HybridBus
// ============================================================================

struct HybridInner {
    config: HybridConfig,
    local: LocalBus,
    remote: Option<RemoteBus>,
    availability: RwLock<Availability>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
}

/// Local bus plus an optional remote bus under a fallback policy
///
/// Remote availability is a binary flag: flipped off by a failed health check or a
/// degraded publish, flipped back on by the next successful check.
#[derive(Clone)]
pub struct HybridBus {
    inner: Arc<HybridInner>,
}

impl HybridBus {
    /// Build a bus whose remote transport is Redis. Nothing connects until `start`.
    pub fn new(config: HybridConfig) -> Result<Self> {
        config.validate()?;

        let remote = if config.enable_remote {
            let remote_config = config.remote.clone().ok_or_else(|| {
                EventBusError::configuration("enable_remote requires remote connection settings")
            })?;
            Some(RemoteBus::redis(remote_config)?)
        } else {
            None
        };

        Ok(Self::assemble(config, remote))
    }

    /// Build a bus over any broker (remote settings other than the connection apply)
    pub fn with_broker(config: HybridConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;

        let remote = if config.enable_remote {
            let remote_config = config.remote.clone().unwrap_or_default();
            Some(RemoteBus::new(remote_config, broker))
        } else {
            None
        };

        Ok(Self::assemble(config, remote))
    }

    /// `new` followed by `start`
    pub async fn connect(config: HybridConfig) -> Result<Self> {
        let bus = Self::new(config)?;
        bus.start().await?;
        Ok(bus)
    }

    fn assemble(config: HybridConfig, remote: Option<RemoteBus>) -> Self {
        let local = LocalBus::new(config.local.clone());
        Self {
            inner: Arc::new(HybridInner {
                config,
                local,
                remote,
                availability: RwLock::new(Availability::Unknown),
                monitor: Mutex::new(None),
                started: Mutex::new(false),
            }),
        }
    }

    /// Connect the remote transport and start the health monitor
    ///
    /// An unreachable remote fails the call only when `fallback_to_local` is off.
    /// Calling again after a successful start is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.inner.started.lock().await;
        if *started {
            return Ok(());
        }

        if let Some(remote) = &self.inner.remote {
            match remote.connect().await {
                Ok(()) => self.set_availability(Availability::Available).await,
                Err(e) => {
                    if !self.inner.config.fallback_to_local {
                        return Err(e);
                    }
                    warn!(error = %e, "remote transport unavailable, starting in local-only mode");
                    self.set_availability(Availability::Unavailable).await;
                }
            }
            self.spawn_monitor().await;
        }

        *started = true;
        let mode = self.mode().await;
        info!(
            mode = %mode,
            remote_enabled = self.inner.remote.is_some(),
            "hybrid event bus started"
        );
        Ok(())
    }

    /// Stop the health monitor and close the remote connections
    pub async fn shutdown(&self) {
        let mut started = self.inner.started.lock().await;

        if let Some(monitor) = self.inner.monitor.lock().await.take() {
            monitor.abort();
        }
        if let Some(remote) = &self.inner.remote {
            remote.disconnect().await;
        }

        *self.inner.availability.write().await = Availability::Unknown;
        *started = false;
        info!("hybrid event bus shut down");
    }

    async fn spawn_monitor(&self) {
        let weak: Weak<HybridInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                HybridBus { inner }.refresh_availability().await;
            }
        });

        if let Some(previous) = self.inner.monitor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Run one remote health check and update availability
    pub async fn refresh_availability(&self) -> Option<RemoteHealth> {
        let remote = self.inner.remote.as_ref()?;
        let health = remote.health_check().await;

        let next = if health.connected {
            Availability::Available
        } else {
            Availability::Unavailable
        };
        self.set_availability(next).await;

        debug!(
            connected = health.connected,
            latency_ms = ?health.latency_ms,
            "remote health check"
        );
        Some(health)
    }

    async fn set_availability(&self, next: Availability) {
        let mut availability = self.inner.availability.write().await;
        let previous = *availability;
        *availability = next;

        match (previous, next) {
            (Availability::Available, Availability::Unavailable) => {
                warn!("remote transport unavailable, switching to local-only mode");
            }
            (Availability::Unavailable, Availability::Available) => {
                info!("remote transport available again, switching to hybrid mode");
            }
            _ => {}
        }
    }

    pub async fn availability(&self) -> Availability {
        *self.inner.availability.read().await
    }

    pub async fn mode(&self) -> BusMode {
        if self.inner.remote.is_some() && self.availability().await == Availability::Available {
            BusMode::Hybrid
        } else {
            BusMode::LocalOnly
        }
    }

    pub fn local(&self) -> &LocalBus {
        &self.inner.local
    }

    pub fn remote(&self) -> Option<&RemoteBus> {
        self.inner.remote.as_ref()
    }

    pub fn config(&self) -> &HybridConfig {
        &self.inner.config
    }

    fn check_targets(&self, local_only: bool, remote_only: bool) -> Result<()> {
        if local_only && remote_only {
            return Err(EventBusError::configuration(
                "local_only and remote_only are mutually exclusive",
            ));
        }
        if remote_only && self.inner.remote.is_none() {
            return Err(EventBusError::configuration(
                "remote_only requested but the remote transport is disabled",
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn subscribe<H: EventHandler>(
        &self,
        kind: impl Into<String>,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriptionId>> {
        self.subscribe_shared(kind, Arc::new(handler), options).await
    }

    /// Register a handler on the selected transports
    ///
    /// Returns one transport-tagged id per leg. When both legs are used, the
    /// handler sees each correlation id once.
    pub async fn subscribe_shared(
        &self,
        kind: impl Into<String>,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriptionId>> {
        self.check_targets(options.local_only, options.remote_only)?;
        let kind = kind.into();

        let remote = match &self.inner.remote {
            Some(remote) if !options.local_only => {
                let available = self.availability().await == Availability::Available;
                (options.remote_only || available).then_some(remote)
            }
            _ => None,
        };
        let use_local = !options.remote_only;

        let handler = if use_local && remote.is_some() {
            Deduplicated::wrap(handler, self.inner.config.dedup_window)
        } else {
            handler
        };

        let mut ids = Vec::with_capacity(2);
        if use_local {
            ids.push(self.inner.local.subscribe_shared(kind.clone(), handler.clone()).await);
        }
        if let Some(remote) = remote {
            ids.push(remote.subscribe_shared(kind.clone(), handler).await);
            if !remote.is_connected().await {
                self.set_availability(Availability::Unavailable).await;
            }
        }

        debug!(kind = %kind, ids = ?ids, "hybrid subscription added");
        Ok(ids)
    }

    /// Revoke subscriptions, routing each id by its transport tag
    pub async fn unsubscribe(&self, ids: &[SubscriptionId]) -> Vec<bool> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = match (id.transport, &self.inner.remote) {
                (Transport::Local, _) => self.inner.local.unsubscribe(id).await,
                (Transport::Remote, Some(remote)) => remote.unsubscribe(id).await,
                (Transport::Remote, None) => false,
            };
            results.push(removed);
        }
        results
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish an event on the selected transports
    ///
    /// Both legs run concurrently and each outcome is reported separately.
    /// Errors are returned only for invalid options or an invalid event.
    pub async fn publish(&self, mut event: Event, options: PublishOptions) -> Result<PublishReport> {
        self.check_targets(options.local_only, options.remote_only)?;
        event.validate()?;
        // Both legs carry the same correlation id so receivers can de-duplicate
        event.ensure_identity();

        let remote = if options.local_only {
            None
        } else {
            self.inner.remote.as_ref()
        };

        let local_leg = async {
            if options.remote_only {
                None
            } else {
                Some(self.inner.local.publish(event.clone()).await)
            }
        };
        let remote_leg = async {
            match remote {
                Some(remote) => Some(remote.publish(event.clone()).await),
                None => None,
            }
        };

        let (local_result, remote_result) = tokio::join!(local_leg, remote_leg);

        let mut report = PublishReport {
            correlation_id: event.correlation_id.clone(),
            local: local_result.transpose()?,
            remote: None,
            remote_error: None,
            local_fallback: None,
        };

        match remote_result {
            None => {}
            Some(Ok(outcome)) => {
                if outcome.is_fallback() {
                    self.set_availability(Availability::Unavailable).await;
                }
                report.remote = Some(outcome);
            }
            Some(Err(e)) => {
                warn!(
                    kind = %event.kind,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "remote publish raised"
                );
                report.remote_error = Some(e.to_string());

                if self.inner.config.fallback_to_local && !options.remote_only {
                    report.local_fallback = Some(self.inner.local.publish(event).await?);
                }
            }
        }

        Ok(report)
    }

    // ========================================================================
    // History and stats
    // ========================================================================

    /// Merged history, de-duplicated by correlation id, newest first
    pub async fn get_event_history(
        &self,
        kind: Option<&str>,
        limit: usize,
        source: HistorySource,
    ) -> Vec<Event> {
        let mut merged = Vec::new();

        if source != HistorySource::Remote {
            merged.extend(self.inner.local.get_event_history(kind, limit).await);
        }
        if source != HistorySource::Local {
            if let Some(remote) = &self.inner.remote {
                merged.extend(remote.get_event_history(kind, limit).await);
            }
        }

        // First occurrence wins; local entries come first
        let mut seen = HashSet::new();
        merged.retain(|event| seen.insert(event.correlation_id.clone()));

        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        merged.truncate(limit);
        merged
    }

    /// Subscription counts and mode, checking the remote transport first
    pub async fn get_stats(&self) -> BusStats {
        let remote_health = self.refresh_availability().await;
        let mut stats = self.current_stats().await;
        stats.remote_health = remote_health;
        stats
    }

    /// Subscription counts and mode as currently known, without a remote check
    pub async fn current_stats(&self) -> BusStats {
        let remote = match &self.inner.remote {
            Some(remote) => Some(remote.get_subscription_stats().await),
            None => None,
        };

        BusStats {
            local: self.inner.local.get_subscription_stats().await,
            remote,
            remote_health: None,
            mode: self.mode().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::broker::MemoryBroker;
    use crate::event_bus::remote::ConnectionState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_handler(counter: Arc<AtomicUsize>) -> impl EventHandler {
        move |_event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }
    }

    fn remote_config() -> HybridConfig {
        HybridConfig {
            enable_remote: true,
            remote: Some(RemoteConfig {
                max_retries: 1,
                retry_delay: Duration::from_millis(5),
                ..RemoteConfig::default()
            }),
            ..HybridConfig::default()
        }
    }

    async fn started(broker: &MemoryBroker) -> HybridBus {
        let bus = HybridBus::with_broker(remote_config(), Arc::new(broker.clone())).unwrap();
        bus.start().await.unwrap();
        bus
    }

    #[test]
    fn test_new_requires_remote_settings() {
        let config = HybridConfig {
            enable_remote: true,
            ..HybridConfig::default()
        };
        assert!(matches!(HybridBus::new(config), Err(EventBusError::Configuration(_))));

        let config = HybridConfig {
            health_check_interval: Duration::ZERO,
            ..HybridConfig::default()
        };
        assert!(HybridBus::new(config).is_err());

        assert!(HybridBus::new(HybridConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_option_combinations() {
        let bus = HybridBus::new(HybridConfig::default()).unwrap();
        bus.start().await.unwrap();

        let both = PublishOptions {
            local_only: true,
            remote_only: true,
        };
        let result = bus.publish(Event::new("x", "u", "o"), both).await;
        assert!(matches!(result, Err(EventBusError::Configuration(_))));

        let result = bus
            .publish(Event::new("x", "u", "o"), PublishOptions::remote_only())
            .await;
        assert!(matches!(result, Err(EventBusError::Configuration(_))));

        let counter = Arc::new(AtomicUsize::new(0));
        let result = bus
            .subscribe("x", counter_handler(counter), SubscribeOptions::remote_only())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_local_only_bus() {
        let bus = HybridBus::new(HybridConfig::default()).unwrap();
        bus.start().await.unwrap();
        assert_eq!(bus.mode().await, BusMode::LocalOnly);

        let counter = Arc::new(AtomicUsize::new(0));
        let ids = bus
            .subscribe("x", counter_handler(counter.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].transport, Transport::Local);

        let report = bus.publish(Event::new("x", "u", "o"), PublishOptions::default()).await.unwrap();
        assert_eq!(report.local.map(|d| d.handlers), Some(1));
        assert!(report.remote.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = bus.get_stats().await;
        assert!(stats.remote.is_none());
        assert!(stats.remote_health.is_none());
    }

    #[tokio::test]
    async fn test_start_fails_without_fallback() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false).await;
        let config = HybridConfig {
            fallback_to_local: false,
            ..remote_config()
        };
        let bus = HybridBus::with_broker(config, Arc::new(broker)).unwrap();

        assert!(matches!(bus.start().await, Err(EventBusError::Transport(_))));
        assert_eq!(bus.availability().await, Availability::Unknown);
    }

    #[tokio::test]
    async fn test_subscription_spanning_both_transports_sees_event_once() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;
        assert_eq!(bus.mode().await, BusMode::Hybrid);

        let counter = Arc::new(AtomicUsize::new(0));
        let ids = bus
            .subscribe("booking.created", counter_handler(counter.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let report = bus
            .publish(
                Event::new("booking.created", "u", "o").with_correlation_id("abc-1"),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.correlation_id, "abc-1");
        assert_eq!(report.remote, Some(RemoteOutcome::Broadcast));

        // Let the broker echo arrive
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert_eq!(bus.unsubscribe(&ids).await, vec![true, true]);
        assert_eq!(bus.unsubscribe(&ids).await, vec![false, false]);
    }

    #[tokio::test]
    async fn test_degraded_publish_flips_availability() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;

        broker.set_reachable(false).await;
        let report = bus.publish(Event::new("x", "u", "o"), PublishOptions::default()).await.unwrap();

        assert!(report.remote.is_some_and(|r| r.is_fallback()));
        assert_eq!(bus.availability().await, Availability::Unavailable);
        assert_eq!(bus.mode().await, BusMode::LocalOnly);

        // Subscribing while degraded registers locally only
        let counter = Arc::new(AtomicUsize::new(0));
        let ids = bus
            .subscribe("x", counter_handler(counter), SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].transport, Transport::Local);

        broker.set_reachable(true).await;
        let stats = bus.get_stats().await;
        assert_eq!(stats.mode, BusMode::Hybrid);
        assert!(stats.remote_health.is_some_and(|h| h.connected));
    }

    #[tokio::test]
    async fn test_local_only_publish_skips_remote() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;

        let report = bus
            .publish(Event::new("x", "u", "o"), PublishOptions::local_only())
            .await
            .unwrap();
        assert!(report.local.is_some());
        assert!(report.remote.is_none());

        let remote_history = bus.get_event_history(None, 10, HistorySource::Remote).await;
        assert!(remote_history.is_empty());
        let local_history = bus.get_event_history(None, 10, HistorySource::Local).await;
        assert_eq!(local_history.len(), 1);
    }

    #[tokio::test]
    async fn test_merged_history_deduplicates() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;

        for id in ["c-1", "c-2"] {
            bus.publish(
                Event::new("x", "u", "o").with_correlation_id(id),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        }

        assert_eq!(bus.get_event_history(None, 10, HistorySource::Local).await.len(), 2);
        assert_eq!(bus.get_event_history(None, 10, HistorySource::Remote).await.len(), 2);

        let merged = bus.get_event_history(None, 10, HistorySource::Both).await;
        let ids: Vec<_> = merged.iter().map(|e| e.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["c-2", "c-1"]);
    }

    #[tokio::test]
    async fn test_shutdown_and_restart() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;

        bus.shutdown().await;
        assert_eq!(bus.mode().await, BusMode::LocalOnly);
        assert_eq!(bus.remote().map(|r| r.config().max_retries), Some(1));

        bus.start().await.unwrap();
        assert_eq!(bus.mode().await, BusMode::Hybrid);
    }

    #[tokio::test]
    async fn test_stats_after_shutdown_do_not_reconnect() {
        let broker = MemoryBroker::new();
        let bus = started(&broker).await;
        bus.subscribe("x", counter_handler(Arc::new(AtomicUsize::new(0))), SubscribeOptions::remote_only())
            .await
            .unwrap();
        assert_eq!(broker.channel_subscribers("x").await, 1);

        bus.shutdown().await;

        let stats = bus.get_stats().await;
        assert_eq!(stats.mode, BusMode::LocalOnly);
        assert!(stats.remote_health.is_some_and(|h| !h.connected));
        let remote = bus.remote().expect("remote transport");
        assert_eq!(remote.connection_state().await, ConnectionState::Closed);
        assert_eq!(broker.channel_subscribers("x").await, 0);

        // Publishing after shutdown stays in-process too
        let report = bus.publish(Event::new("x", "u", "o"), PublishOptions::default()).await.unwrap();
        assert!(report.remote.is_some_and(|r| r.is_fallback()));
        assert_eq!(broker.channel_subscribers("x").await, 0);
    }
}
