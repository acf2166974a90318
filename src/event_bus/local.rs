use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::handler::{dispatch, Delivery, EventHandler, Registration, SharedHandler};
use super::types::{Event, SubscriptionId};
use crate::error::Result;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct LocalBusConfig {
    /// Maximum retained events (oldest evicted first)
    pub history_capacity: usize,
    pub enable_history: bool,
}

impl Default for LocalBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            enable_history: true,
        }
    }
}

#[derive(Default)]
struct SubscriberTable {
    /// kind -> registrations, in subscription order
    by_kind: HashMap<String, Vec<Registration>>,
    /// subscription id -> kind
    kinds: HashMap<SubscriptionId, String>,
}

struct LocalInner {
    config: LocalBusConfig,
    table: RwLock<SubscriberTable>,
    history: RwLock<VecDeque<Event>>,
}

/// In-process event bus
///
/// Delivers each event to every handler subscribed to its exact kind.
/// A failing handler never affects its siblings or the publisher: the
/// failure is logged and re-published as a `system.error` event.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalInner>,
}

impl LocalBus {
    pub fn new(config: LocalBusConfig) -> Self {
        let capacity = config.history_capacity.min(DEFAULT_HISTORY_CAPACITY);
        Self {
            inner: Arc::new(LocalInner {
                config,
                table: RwLock::new(SubscriberTable::default()),
                history: RwLock::new(VecDeque::with_capacity(capacity)),
            }),
        }
    }

    /// Register a handler for an event kind
    pub async fn subscribe<H: EventHandler>(&self, kind: impl Into<String>, handler: H) -> SubscriptionId {
        self.subscribe_shared(kind, Arc::new(handler)).await
    }

    pub async fn subscribe_shared(&self, kind: impl Into<String>, handler: SharedHandler) -> SubscriptionId {
        let kind = kind.into();
        let id = SubscriptionId::local();

        let mut table = self.inner.table.write().await;
        table
            .by_kind
            .entry(kind.clone())
            .or_default()
            .push(Registration { id, handler });
        table.kinds.insert(id, kind.clone());

        debug!(kind = %kind, subscription_id = %id, "local subscription added");
        id
    }

    /// Revoke a subscription. Returns false for unknown (or already revoked) ids.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut table = self.inner.table.write().await;

        let Some(kind) = table.kinds.remove(id) else {
            return false;
        };

        if let Some(registrations) = table.by_kind.get_mut(&kind) {
            registrations.retain(|r| r.id != *id);
            if registrations.is_empty() {
                table.by_kind.remove(&kind);
            }
        }

        debug!(kind = %kind, subscription_id = %id, "local subscription removed");
        true
    }

    pub async fn is_subscribed(&self, id: &SubscriptionId) -> bool {
        self.inner.table.read().await.kinds.contains_key(id)
    }

    /// Publish an event to in-process subscribers
    ///
    /// This will:
    /// 1. Validate the event and assign its correlation id
    /// 2. Append it to the bounded history
    /// 3. Invoke a snapshot of the kind's handlers concurrently
    ///
    /// Resolves once every handler has settled. Only validation errors are returned.
    pub async fn publish(&self, mut event: Event) -> Result<Delivery> {
        event.validate()?;
        event.ensure_identity();

        self.record(&event).await;

        // Snapshot so concurrent (un)subscribes don't touch this dispatch
        let snapshot = {
            let table = self.inner.table.read().await;
            table.by_kind.get(&event.kind).cloned().unwrap_or_default()
        };

        debug!(
            kind = %event.kind,
            correlation_id = %event.correlation_id,
            handlers = snapshot.len(),
            "dispatching local event"
        );

        let delivery = dispatch(&event, snapshot).await;
        self.report_failures(&event, &delivery);

        Ok(delivery)
    }

    fn report_failures(&self, event: &Event, delivery: &Delivery) {
        for failure in &delivery.failures {
            error!(
                kind = %event.kind,
                correlation_id = %event.correlation_id,
                subscription_id = %failure.subscription_id,
                error = %failure.message,
                "local event handler failed"
            );

            if event.is_error_event() {
                warn!(
                    kind = %event.kind,
                    "handler failed on an error event, not re-publishing"
                );
                continue;
            }

            let error_event = Event::system_error(event, &failure.subscription_id, &failure.message);
            tokio::spawn(self.republish(error_event));
        }
    }

    /// Re-publish on a fresh task so handler failures never grow the stack.
    fn republish(&self, event: Event) -> BoxFuture<'static, ()> {
        let bus = self.clone();
        Box::pin(async move {
            if let Err(e) = bus.publish(event).await {
                warn!(error = %e, "failed to publish system.error event");
            }
        })
    }

    async fn record(&self, event: &Event) {
        if !self.inner.config.enable_history || self.inner.config.history_capacity == 0 {
            return;
        }

        let mut history = self.inner.history.write().await;
        while history.len() >= self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Recent events, newest first
    pub async fn get_event_history(&self, kind: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.read().await;

        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .cloned()
            .collect();

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        events
    }

    pub async fn clear_history(&self) {
        self.inner.history.write().await.clear();
    }

    /// kind -> number of active subscriptions
    pub async fn get_subscription_stats(&self) -> HashMap<String, usize> {
        let table = self.inner.table.read().await;
        table
            .by_kind
            .iter()
            .map(|(kind, registrations)| (kind.clone(), registrations.len()))
            .collect()
    }

    pub async fn subscriber_count(&self, kind: &str) -> usize {
        let table = self.inner.table.read().await;
        table.by_kind.get(kind).map(Vec::len).unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(LocalBusConfig::default())
    }
}
