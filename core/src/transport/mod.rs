/// Realtime transport: STOMP framing, desired subscriptions and the session
pub mod connection;
pub mod registry;
pub mod stomp;

pub use connection::{ConnectionManager, ConnectionState, Delivery, SessionHandle};
pub use registry::{SubscriptionRegistry, Topic, SESSION_TOPICS};
pub use stomp::{Command, StompFrame};
