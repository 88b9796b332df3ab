//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + command line overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BrokerConfig (validated, immutable)
//!     → listener configs shared via Arc with the listener manager
//!
//! On reload signal:
//!     SIGHUP / admin API / watcher.rs raise the reload flag
//!     → run loop calls ConfigSource::load again
//!     → listener manager diffs and applies the new listener set
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{ConfigError, ConfigSource, FileSource, Overrides, StaticSource};
pub use schema::BrokerConfig;
pub use schema::ListenerConfig;
pub use schema::Protocol;
pub use schema::TlsConfig;
pub use schema::{AdminConfig, LifecycleConfig, ObservabilityConfig};
