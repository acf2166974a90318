/// Standard event kinds (namespace-prefixed)
///
/// Event kinds follow the format: `<category>.<action>` and double as the
/// broker channel name, so they must stay stable once published.
///
/// Categories:
/// - location / booking / user: domain events emitted by collaborators
/// - system: events synthesized by the bus itself

pub struct EventKind;

impl EventKind {
    // ========================================================================
    // Location lifecycle
    // ========================================================================
    pub const LOCATION_CREATED: &'static str = "location.created";
    pub const LOCATION_UPDATED: &'static str = "location.updated";
    pub const LOCATION_DELETED: &'static str = "location.deleted";

    // ========================================================================
    // Booking lifecycle
    // ========================================================================
    pub const BOOKING_CREATED: &'static str = "booking.created";
    pub const BOOKING_UPDATED: &'static str = "booking.updated";
    pub const BOOKING_DELETED: &'static str = "booking.deleted";

    // ========================================================================
    // User lifecycle
    // ========================================================================
    pub const USER_CREATED: &'static str = "user.created";
    pub const USER_UPDATED: &'static str = "user.updated";
    pub const USER_DELETED: &'static str = "user.deleted";

    // ========================================================================
    // System
    // ========================================================================
    pub const SYSTEM_ERROR: &'static str = "system.error";
    pub const SYSTEM_EVENTBUS_INITIALIZED: &'static str = "system.eventbus.initialized";
    pub const SYSTEM_EVENTBUS_SHUTDOWN: &'static str = "system.eventbus.shutdown";

    /// Kinds whose payload shape is owned by the bus.
    pub const RESERVED: [&'static str; 3] = [
        Self::SYSTEM_ERROR,
        Self::SYSTEM_EVENTBUS_INITIALIZED,
        Self::SYSTEM_EVENTBUS_SHUTDOWN,
    ];

    /// Entity actions accepted with an `Entity` payload.
    pub const ENTITY_ACTIONS: [&'static str; 3] = ["created", "updated", "deleted"];

    pub fn is_reserved(kind: &str) -> bool {
        Self::RESERVED.contains(&kind)
    }

    /// Any `<category>.error` kind counts as an error kind.
    pub fn is_error_kind(kind: &str) -> bool {
        kind == Self::SYSTEM_ERROR || kind.ends_with(".error")
    }

    /// Split `location.created` into (`location`, `created`).
    pub fn split(kind: &str) -> Option<(&str, &str)> {
        kind.rsplit_once('.')
            .filter(|(namespace, action)| !namespace.is_empty() && !action.is_empty())
    }
}
