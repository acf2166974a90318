use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use super::handler::EventHandler;
use super::hybrid::{
    BusStats, HistorySource, HybridBus, PublishOptions, PublishReport, SubscribeOptions,
};
use super::kinds::EventKind;
use super::types::{BusLifecycleData, BusMode, Event, EventPayload, SubscriptionId};
use crate::config::Settings;
use crate::error::{EventBusError, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Stamped into `metadata.service` of published events
    pub service_name: String,
    /// Stamped into `metadata.source` of published events
    pub component: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_name: "hybrid-eventbus".to_string(),
            component: "event-bus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerHealth {
    pub status: HealthStatus,
    pub details: Value,
}

struct ManagerInner {
    bus: HybridBus,
    config: ManagerConfig,
    initialized: Mutex<bool>,
}

/// Process-wide event bus context
///
/// Construct once at startup and hand out clones. Every operation initializes
/// the bus on first use.
#[derive(Clone)]
pub struct EventBusManager {
    inner: Arc<ManagerInner>,
}

impl EventBusManager {
    pub fn new(bus: HybridBus, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                config,
                initialized: Mutex::new(false),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let bus = HybridBus::new(settings.hybrid_config())?;
        Ok(Self::new(bus, settings.manager_config()))
    }

    pub fn bus(&self) -> &HybridBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub async fn is_initialized(&self) -> bool {
        *self.inner.initialized.lock().await
    }

    /// Start the bus and announce it with `system.eventbus.initialized`
    pub async fn initialize(&self) -> Result<()> {
        let mut initialized = self.inner.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.inner.bus.start().await?;
        let stats = self.inner.bus.get_stats().await;
        *initialized = true;
        // Released before publishing: handlers may call back into the manager
        drop(initialized);

        let event = Event::system(
            EventKind::SYSTEM_EVENTBUS_INITIALIZED,
            EventPayload::BusInitialized(self.lifecycle_data(&stats)),
        );
        self.inner.bus.publish(self.enrich(event), PublishOptions::default()).await?;

        info!(
            service = %self.inner.config.service_name,
            mode = %stats.mode,
            "event bus initialized"
        );
        Ok(())
    }

    fn lifecycle_data(&self, stats: &BusStats) -> BusLifecycleData {
        BusLifecycleData {
            service: self.inner.config.service_name.clone(),
            mode: stats.mode,
            remote_enabled: self.inner.bus.remote().is_some(),
            local_subscriptions: stats.local.values().sum(),
            remote_subscriptions: stats.remote.as_ref().map(|r| r.values().sum()),
        }
    }

    /// Fill provenance the caller left empty
    fn enrich(&self, mut event: Event) -> Event {
        let metadata = &mut event.metadata;
        metadata
            .service
            .get_or_insert_with(|| self.inner.config.service_name.clone());
        metadata
            .source
            .get_or_insert_with(|| self.inner.config.component.clone());
        metadata.published_at.get_or_insert_with(Utc::now);
        event
    }

    pub async fn publish(&self, event: Event) -> Result<PublishReport> {
        self.publish_with(event, PublishOptions::default()).await
    }

    pub async fn publish_with(&self, event: Event, options: PublishOptions) -> Result<PublishReport> {
        self.initialize().await?;
        self.inner.bus.publish(self.enrich(event), options).await
    }

    pub async fn subscribe<H: EventHandler>(
        &self,
        kind: impl Into<String>,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriptionId>> {
        self.initialize().await?;
        self.inner.bus.subscribe(kind, handler, options).await
    }

    pub async fn unsubscribe(&self, ids: &[SubscriptionId]) -> Result<Vec<bool>> {
        self.initialize().await?;
        Ok(self.inner.bus.unsubscribe(ids).await)
    }

    /// Wait for the next event of `kind`
    pub async fn wait_for_event(&self, kind: &str, timeout: Duration) -> Result<Event> {
        self.wait_for_event_matching(kind, timeout, |_| true).await
    }

    /// Wait for the next event of `kind` accepted by `predicate`
    ///
    /// The transient subscription is removed on match, on timeout, and when
    /// the returned future is dropped early.
    pub async fn wait_for_event_matching<P>(
        &self,
        kind: &str,
        timeout: Duration,
        predicate: P,
    ) -> Result<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let predicate = Arc::new(predicate);

        let handler = move |event: Event| {
            let slot = slot.clone();
            let predicate = predicate.clone();
            async move {
                if predicate(&event) {
                    if let Some(tx) = slot.lock().await.take() {
                        let _ = tx.send(event);
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
        };

        let ids = self.subscribe(kind, handler, SubscribeOptions::default()).await?;
        let subscription = TransientSubscription {
            bus: self.inner.bus.clone(),
            ids,
        };
        let outcome = tokio::time::timeout(timeout, rx).await;
        subscription.remove().await;

        match outcome {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) | Err(_) => Err(EventBusError::Timeout {
                kind: kind.to_string(),
                timeout,
            }),
        }
    }

    /// `healthy` in hybrid mode with the remote connected, `degraded` in
    /// local-only mode, `unhealthy` when stats cannot be read.
    pub async fn health_check(&self) -> ManagerHealth {
        if let Err(e) = self.initialize().await {
            error!(error = %e, "event bus health check failed");
            return ManagerHealth {
                status: HealthStatus::Unhealthy,
                details: json!({ "error": e.to_string() }),
            };
        }

        let stats = self.inner.bus.get_stats().await;
        let remote_connected = stats.remote_health.as_ref().is_some_and(|h| h.connected);

        let status = match stats.mode {
            BusMode::Hybrid if remote_connected => HealthStatus::Healthy,
            BusMode::Hybrid | BusMode::LocalOnly => HealthStatus::Degraded,
        };

        match serde_json::to_value(&stats) {
            Ok(details) => ManagerHealth { status, details },
            Err(e) => ManagerHealth {
                status: HealthStatus::Unhealthy,
                details: json!({ "error": e.to_string() }),
            },
        }
    }

    pub async fn get_stats(&self) -> Result<BusStats> {
        self.initialize().await?;
        Ok(self.inner.bus.get_stats().await)
    }

    pub async fn get_event_history(
        &self,
        kind: Option<&str>,
        limit: usize,
        source: HistorySource,
    ) -> Result<Vec<Event>> {
        self.initialize().await?;
        Ok(self.inner.bus.get_event_history(kind, limit, source).await)
    }

    /// Announce `system.eventbus.shutdown`, close the bus, reset initialization
    pub async fn shutdown(&self) {
        let mut initialized = self.inner.initialized.lock().await;
        if !*initialized {
            return;
        }
        *initialized = false;
        drop(initialized);

        let stats = self.inner.bus.current_stats().await;
        let event = Event::system(
            EventKind::SYSTEM_EVENTBUS_SHUTDOWN,
            EventPayload::BusShutdown(self.lifecycle_data(&stats)),
        );
        if let Err(e) = self
            .inner
            .bus
            .publish(self.enrich(event), PublishOptions::default())
            .await
        {
            warn!(error = %e, "failed to publish shutdown event");
        }

        self.inner.bus.shutdown().await;
        info!(service = %self.inner.config.service_name, "event bus shut down");
    }
}

/// Subscription owned by a single wait; unsubscribed on drop
struct TransientSubscription {
    bus: HybridBus,
    ids: Vec<SubscriptionId>,
}

impl TransientSubscription {
    async fn remove(mut self) {
        self.bus.unsubscribe(&self.ids).await;
        self.ids.clear();
    }
}

impl Drop for TransientSubscription {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let bus = self.bus.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    bus.unsubscribe(&ids).await;
                });
            }
            Err(_) => warn!(
                subscriptions = ids.len(),
                "no runtime left to remove transient subscriptions"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::hybrid::HybridConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_manager() -> EventBusManager {
        let bus = HybridBus::new(HybridConfig::default()).unwrap();
        EventBusManager::new(
            bus,
            ManagerConfig {
                service_name: "booking-service".to_string(),
                component: "api".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let manager = local_manager();
        let announcements = Arc::new(AtomicUsize::new(0));
        let counter = announcements.clone();
        manager
            .bus()
            .local()
            .subscribe(EventKind::SYSTEM_EVENTBUS_INITIALIZED, move |_event: Event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await;

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        manager.publish(Event::new("x", "u", "o")).await.unwrap();

        assert!(manager.is_initialized().await);
        assert_eq!(announcements.load(Ordering::SeqCst), 1);

        let history = manager
            .get_event_history(Some(EventKind::SYSTEM_EVENTBUS_INITIALIZED), 10, HistorySource::Local)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        match &history[0].metadata.payload {
            EventPayload::BusInitialized(data) => {
                assert_eq!(data.service, "booking-service");
                assert_eq!(data.mode, BusMode::LocalOnly);
                assert!(!data.remote_enabled);
                assert_eq!(data.local_subscriptions, 1);
            }
            other => panic!("Expected BusInitialized payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_enriches_provenance() {
        let manager = local_manager();
        manager
            .publish(Event::new("booking.created", "u", "o").with_correlation_id("abc-1"))
            .await
            .unwrap();
        manager
            .publish(Event::new("booking.updated", "u", "o").with_source("worker"))
            .await
            .unwrap();

        let history = manager
            .get_event_history(Some("booking.created"), 1, HistorySource::Local)
            .await
            .unwrap();
        let metadata = &history[0].metadata;
        assert_eq!(metadata.service.as_deref(), Some("booking-service"));
        assert_eq!(metadata.source.as_deref(), Some("api"));
        assert!(metadata.published_at.is_some());

        let history = manager
            .get_event_history(Some("booking.updated"), 1, HistorySource::Local)
            .await
            .unwrap();
        assert_eq!(history[0].metadata.source.as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn test_wait_for_event_resolves_with_match() {
        let manager = local_manager();
        manager.initialize().await.unwrap();

        let publisher = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for id in ["skip-me", "take-me"] {
                let _ = publisher
                    .publish(Event::new("x", "u", "o").with_correlation_id(id))
                    .await;
            }
        });

        let event = manager
            .wait_for_event_matching("x", Duration::from_secs(1), |e| e.correlation_id == "take-me")
            .await
            .unwrap();
        assert_eq!(event.correlation_id, "take-me");
        assert!(manager.get_stats().await.unwrap().local.get("x").is_none());
    }

    #[tokio::test]
    async fn test_wait_for_event_times_out() {
        let manager = local_manager();
        let result = manager.wait_for_event("x", Duration::from_millis(100)).await;

        match result {
            Err(EventBusError::Timeout { kind, timeout }) => {
                assert_eq!(kind, "x");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(manager.get_stats().await.unwrap().local.get("x").is_none());
    }

    #[tokio::test]
    async fn test_health_degraded_without_remote() {
        let manager = local_manager();
        let health = manager.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.details["mode"], "local-only");
    }

    #[tokio::test]
    async fn test_shutdown_resets_initialization() {
        let manager = local_manager();
        manager.initialize().await.unwrap();
        manager.shutdown().await;
        assert!(!manager.is_initialized().await);

        let history = manager
            .bus()
            .get_event_history(Some(EventKind::SYSTEM_EVENTBUS_SHUTDOWN), 10, HistorySource::Local)
            .await;
        assert_eq!(history.len(), 1);

        // Shutting down twice is a no-op
        manager.shutdown().await;
        manager.publish(Event::new("x", "u", "o")).await.unwrap();
        assert!(manager.is_initialized().await);
    }
}
