//! mqttd: MQTT broker bootstrap and listener lifecycle manager.

pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod process;
pub mod routing;
pub mod security;

pub use config::schema::BrokerConfig;
pub use lifecycle::{Coordinator, Outcome, ProcessState, Shutdown};
pub use net::ListenerManager;
