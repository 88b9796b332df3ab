//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! TLS handshake completes
//!     → net::tls (certificate CN or subject extracted)
//!     → identity.rs (identity mapped to a username, or rejected)
//!     → Pass to routing core
//! ```
//!
//! # Design Decisions
//! - Fail closed: a rejected identity closes the connection before handoff
//! - Certificate verification itself stays in rustls

pub mod identity;

pub use identity::{IdentityLookup, PassThrough};
