//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Enforce the endpoint invariant (port xor unix socket path)
//! - Check TLS option combinations
//! - Detect listeners competing for the same socket
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BrokerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use thiserror::Error;

use crate::config::schema::{BrokerConfig, ListenerConfig, Protocol};

/// A single semantic problem, tagged with the listener index it was found on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener #{0}: exactly one of bind_port and unix_socket_path must be set")]
    EndpointAmbiguous(usize),

    #[error("listener #{0}: bind_host and bind_interface require bind_port")]
    HostWithoutPort(usize),

    #[error("listener #{0}: TLS is not available on unix sockets")]
    TlsOnUnixSocket(usize),

    #[error("listener #{0}: cert_file and key_file must be given together")]
    CertKeyMismatch(usize),

    #[error("listener #{0}: {1} requires ca_file")]
    MissingCa(usize, &'static str),

    #[error("listener #{0}: {1} requires require_client_cert")]
    ClientCertRequired(usize, &'static str),

    #[error("listener #{0}: use_identity_as_username and use_subject_as_username are mutually exclusive")]
    UsernameSourceConflict(usize),

    #[error("listener #{0}: unsupported tls_version_min {1:?} (expected tlsv1.2 or tlsv1.3)")]
    TlsVersion(usize, String),

    #[error("listener #{0}: max_qos must be 0, 1 or 2 (got {1})")]
    MaxQos(usize, u8),

    #[error("listener #{0}: mount_point is only valid on websockets listeners")]
    MountPointProtocol(usize),

    #[error("listener #{0}: mount_point must start with '/'")]
    MountPointFormat(usize),

    #[error("listener #{0}: max_connections must be greater than zero")]
    ZeroConnections(usize),

    #[error("listener #{index}: duplicates listener #{first} ({endpoint})")]
    Duplicate {
        index: usize,
        first: usize,
        endpoint: String,
    },

    #[error("listener #{index}: port {port} is bound both to a wildcard and to a specific address")]
    WildcardConflict { index: usize, port: u16 },

    #[error("local_only_port must not be zero")]
    LocalOnlyPort,
}

/// Validate a whole broker configuration.
pub fn validate_config(config: &BrokerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() && config.local_only_port == 0 {
        errors.push(ValidationError::LocalOnlyPort);
    }
    if config.max_connections == Some(0) {
        errors.push(ValidationError::ZeroConnections(0));
    }

    for (index, listener) in config.listeners.iter().enumerate() {
        validate_listener(index, listener, &mut errors);
    }
    validate_endpoints(&config.listeners, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(index: usize, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    let has_port = listener.bind_port.is_some();
    let has_path = listener.unix_socket_path.is_some();
    if has_port == has_path {
        errors.push(ValidationError::EndpointAmbiguous(index));
    }
    if !has_port && (listener.bind_host.is_some() || listener.bind_interface.is_some()) {
        errors.push(ValidationError::HostWithoutPort(index));
    }
    if listener.max_qos > 2 {
        errors.push(ValidationError::MaxQos(index, listener.max_qos));
    }
    if listener.max_connections == Some(0) {
        errors.push(ValidationError::ZeroConnections(index));
    }

    if let Some(mount) = &listener.mount_point {
        if listener.protocol != Protocol::Websockets {
            errors.push(ValidationError::MountPointProtocol(index));
        }
        if !mount.starts_with('/') {
            errors.push(ValidationError::MountPointFormat(index));
        }
    }

    let Some(tls) = &listener.tls else {
        return;
    };
    if has_path {
        errors.push(ValidationError::TlsOnUnixSocket(index));
    }
    if tls.cert_file.is_some() != tls.key_file.is_some() {
        errors.push(ValidationError::CertKeyMismatch(index));
    }
    if tls.require_client_cert && tls.ca_file.is_none() {
        errors.push(ValidationError::MissingCa(index, "require_client_cert"));
    }
    if tls.crl_file.is_some() && tls.ca_file.is_none() {
        errors.push(ValidationError::MissingCa(index, "crl_file"));
    }
    if tls.use_identity_as_username && tls.use_subject_as_username {
        errors.push(ValidationError::UsernameSourceConflict(index));
    }
    if tls.use_identity_as_username && !tls.require_client_cert {
        errors.push(ValidationError::ClientCertRequired(index, "use_identity_as_username"));
    }
    if tls.use_subject_as_username && !tls.require_client_cert {
        errors.push(ValidationError::ClientCertRequired(index, "use_subject_as_username"));
    }
    if let Some(version) = &tls.tls_version_min {
        if !matches!(version.as_str(), "tlsv1.2" | "tlsv1.3") {
            errors.push(ValidationError::TlsVersion(index, version.clone()));
        }
    }
}

/// Address families a wildcard host covers, as `(ipv4, ipv6)`. `None` for specific hosts.
fn wildcard_families(host: Option<&str>) -> Option<(bool, bool)> {
    match host {
        None => Some((true, true)),
        Some(h) => match h.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if ip.is_unspecified() => Some((true, false)),
            Ok(IpAddr::V6(ip)) if ip.is_unspecified() => Some((false, true)),
            _ => None,
        },
    }
}

/// What two listeners must not share: the socket, whatever protocol runs on it.
///
/// Ephemeral ports never collide, so they keep the protocol in the key.
fn socket_key(listener: &ListenerConfig) -> String {
    if let Some(path) = &listener.unix_socket_path {
        return format!("unix:{}", path.display());
    }
    match listener.bind_port {
        Some(port) if port != 0 => {
            let host = listener.bind_host.as_deref().unwrap_or("*");
            match &listener.bind_interface {
                Some(iface) => format!("{host}:{port}%{iface}"),
                None => format!("{host}:{port}"),
            }
        }
        _ => listener.endpoint_key(),
    }
}

fn validate_endpoints(listeners: &[ListenerConfig], errors: &mut Vec<ValidationError>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut wildcard_ports: HashSet<(u16, bool)> = HashSet::new();
    let mut specific_ports: HashMap<u16, usize> = HashMap::new();

    for (index, listener) in listeners.iter().enumerate() {
        let key = socket_key(listener);
        if let Some(&first) = seen.get(&key) {
            errors.push(ValidationError::Duplicate {
                index,
                first,
                endpoint: key,
            });
            continue;
        }
        seen.insert(key, index);

        let Some(port) = listener.bind_port else {
            continue;
        };
        // Ephemeral ports never collide.
        if port == 0 {
            continue;
        }
        match wildcard_families(listener.bind_host.as_deref()) {
            Some((v4, v6)) => {
                let overlaps = (v4 && wildcard_ports.contains(&(port, false)))
                    || (v6 && wildcard_ports.contains(&(port, true)));
                if overlaps || specific_ports.contains_key(&port) {
                    errors.push(ValidationError::WildcardConflict { index, port });
                }
                if v4 {
                    wildcard_ports.insert((port, false));
                }
                if v6 {
                    wildcard_ports.insert((port, true));
                }
            }
            None => {
                if wildcard_ports.contains(&(port, false)) || wildcard_ports.contains(&(port, true)) {
                    errors.push(ValidationError::WildcardConflict { index, port });
                }
                specific_ports.entry(port).or_insert(index);
            }
        }
    }
}
