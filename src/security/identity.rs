//! Mapping TLS client identities to broker usernames.
//!
//! When a listener sets `use_identity_as_username` or
//! `use_subject_as_username`, the name taken from the verified client
//! certificate is passed through an `IdentityLookup` before the connection
//! reaches the routing core. The auth plugin system plugs in here.

/// Resolves a certificate identity to the username the session runs as.
pub trait IdentityLookup: Send + Sync {
    /// `None` rejects the connection.
    fn lookup(&self, identity: &str) -> Option<String>;
}

/// Accepts every identity unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl IdentityLookup for PassThrough {
    fn lookup(&self, identity: &str) -> Option<String> {
        Some(identity.to_string())
    }
}

impl<F> IdentityLookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn lookup(&self, identity: &str) -> Option<String> {
        self(identity)
    }
}
