//! Embedded MQTT 3.1.1 broker.
//!
//! - `protocol` - packet parsing and encoding
//! - `subscriptions` - topic-filter fan-out to live sessions
//! - `broker` - authorization-gated publish/subscribe and session registry
//! - `session` - per-connection state machine (CONNECT, keep-alive, QoS 1 retry, wills)

pub mod broker;
pub mod protocol;
pub mod session;
pub mod subscriptions;

// Re-export protocol types at module level for convenience
pub use protocol::*;

pub use self::broker::Broker;
pub use self::session::{
    run_session, CloseReason, ConnectionMeta, SessionContext, SessionOutcome,
    SessionPhase, SessionSettings,
};
pub use self::subscriptions::{Delivery, SessionId, SubscriptionRouter};
