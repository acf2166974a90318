//! Hybrid in-process / Redis pub-sub event distribution.

pub mod config;
pub mod error;
pub mod event_bus;

pub use crate::config::Settings;
pub use error::{EventBusError, Result};
pub use event_bus::{
    Event, EventBusManager, EventHandler, EventKind, EventPayload, HybridBus, HybridConfig,
    LocalBus, PublishOptions, RemoteBus, SubscribeOptions, SubscriptionId,
};
