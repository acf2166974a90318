use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::types::{Event, SubscriptionId};

/// Subscriber callback.
///
/// Implemented for any `Fn(Event) -> impl Future<Output = anyhow::Result<()>>`,
/// so plain async closures can be registered directly.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// A handler registered under a subscription id
#[derive(Clone)]
pub(crate) struct Registration {
    pub id: SubscriptionId,
    pub handler: SharedHandler,
}

/// A handler that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub subscription_id: SubscriptionId,
    pub message: String,
}

/// Outcome of dispatching one event to a snapshot of handlers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub handlers: usize,
    pub failures: Vec<HandlerFailure>,
}

impl Delivery {
    pub fn succeeded(&self) -> usize {
        self.handlers - self.failures.len()
    }
}

/// Invoke every registration concurrently and collect failures.
///
/// Handlers are first polled in registration order. Errors and panics are
/// caught per handler; the returned future always resolves.
pub(crate) async fn dispatch(event: &Event, registrations: Vec<Registration>) -> Delivery {
    let handlers = registrations.len();

    let calls = registrations.into_iter().map(|registration| {
        let event = event.clone();
        async move {
            let outcome = AssertUnwindSafe(registration.handler.handle(event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(HandlerFailure {
                    subscription_id: registration.id,
                    message: format!("{:#}", e),
                }),
                Err(panic) => Some(HandlerFailure {
                    subscription_id: registration.id,
                    message: format!("handler panicked: {}", panic_message(panic.as_ref())),
                }),
            }
        }
    });

    let failures = join_all(calls).await.into_iter().flatten().collect();

    Delivery { handlers, failures }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Correlation-id de-duplication
// ============================================================================

/// Bounded window of recently seen correlation ids (FIFO eviction)
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Wraps a handler so one logical event reaching it through several
/// transports is handled once.
pub(crate) struct Deduplicated {
    inner: SharedHandler,
    recent: Mutex<RecentIds>,
}

impl Deduplicated {
    pub fn wrap(inner: SharedHandler, window: usize) -> SharedHandler {
        Arc::new(Self {
            inner,
            recent: Mutex::new(RecentIds::new(window)),
        })
    }
}

#[async_trait]
impl EventHandler for Deduplicated {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if !event.correlation_id.is_empty()
            && !self.recent.lock().await.insert(&event.correlation_id)
        {
            tracing::debug!(
                kind = %event.kind,
                correlation_id = %event.correlation_id,
                "skipping duplicate delivery"
            );
            return Ok(());
        }
        self.inner.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> SharedHandler {
        Arc::new(move |_event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    async fn failing_handler(_event: Event) -> anyhow::Result<()> {
        anyhow::bail!("handler exploded")
    }

    async fn panicking_handler(_event: Event) -> anyhow::Result<()> {
        panic!("handler panicked hard")
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let failing: SharedHandler = Arc::new(failing_handler);
        let panicking: SharedHandler = Arc::new(panicking_handler);

        let registrations = vec![
            Registration { id: SubscriptionId::local(), handler: counting_handler(counter.clone()) },
            Registration { id: SubscriptionId::local(), handler: failing },
            Registration { id: SubscriptionId::local(), handler: panicking },
            Registration { id: SubscriptionId::local(), handler: counting_handler(counter.clone()) },
        ];
        let failing_id = registrations[1].id;

        let event = Event::new("booking.created", "u", "o");
        let delivery = dispatch(&event, registrations).await;

        assert_eq!(delivery.handlers, 4);
        assert_eq!(delivery.failures.len(), 2);
        assert_eq!(delivery.succeeded(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(delivery.failures[0].subscription_id, failing_id);
        assert!(delivery.failures[0].message.contains("handler exploded"));
        assert!(delivery.failures[1].message.contains("handler panicked hard"));
    }

    #[tokio::test]
    async fn test_dispatch_empty() {
        let delivery = dispatch(&Event::new("x", "u", "o"), Vec::new()).await;
        assert_eq!(delivery, Delivery::default());
    }

    #[tokio::test]
    async fn test_deduplicated_skips_same_correlation_id() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = Deduplicated::wrap(counting_handler(counter.clone()), 8);

        let event = Event::new("x", "u", "o").with_correlation_id("abc-1");
        handler.handle(event.clone()).await.unwrap();
        handler.handle(event).await.unwrap();
        handler
            .handle(Event::new("x", "u", "o").with_correlation_id("abc-2"))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("c"));
        // "a" fell out of the window
        assert!(recent.insert("a"));
        assert!(!recent.insert("c"));
    }
}
