// Hybrid event bus
//
// Events are delivered in-process through the local bus and, when a broker is
// configured, across processes through the remote bus. The hybrid bus composes
// both and degrades to local-only delivery while the broker is unreachable.

pub mod broker;
pub mod handler;
pub mod hybrid;
pub mod kinds;
pub mod local;
pub mod manager;
pub mod remote;
pub mod types;

pub use broker::{Broker, BrokerError, BrokerMessage, MemoryBroker, RedisBroker};
pub use handler::{Delivery, EventHandler, HandlerFailure, SharedHandler};
pub use hybrid::{
    Availability, BusStats, HistorySource, HybridBus, HybridConfig, PublishOptions, PublishReport,
    SubscribeOptions,
};
pub use kinds::EventKind;
pub use local::{LocalBus, LocalBusConfig};
pub use manager::{EventBusManager, HealthStatus, ManagerConfig, ManagerHealth};
pub use remote::{ConnectionState, RemoteBus, RemoteConfig, RemoteHealth, RemoteOutcome};
pub use types::{
    BusLifecycleData, BusMode, EntityData, Event, EventMetadata, EventPayload, SubscriptionId,
    SystemErrorData, Transport,
};
