//! TLS configuration and certificate loading.
//!
//! Builds a rustls server context from a listener's TLS block: server chain and
//! key, optional client verification against a CA with CRLs, protocol floor and
//! cipher selection. Contexts are immutable; a reload builds a new one and the
//! listener swaps it in.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Errors that can occur when building a TLS context.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate configured")]
    NoCertificate,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertsFound(PathBuf),

    #[error("no private key found in {0}")]
    NoKeyFound(PathBuf),

    #[error("cipher_list {0:?} matches no supported cipher suite")]
    NoMatchingCiphers(String),

    #[error("unsupported tls_version_min {0:?}")]
    Version(String),

    #[error("failed to build client verifier: {0}")]
    Verifier(String),

    #[error("failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

/// How the authenticated username is derived from a client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameSource {
    None,
    /// Certificate common name.
    Identity,
    /// Full certificate subject.
    Subject,
}

/// A loaded, ready-to-use server context.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    username_source: UsernameSource,
    fingerprint: TlsFingerprint,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("username_source", &self.username_source)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl TlsContext {
    /// Load every file referenced by `config` and build a context.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let fingerprint = TlsFingerprint::capture(config);
        let cert_path = config.cert_file.as_deref().ok_or(TlsError::NoCertificate)?;
        let key_path = config.key_file.as_deref().ok_or(TlsError::NoCertificate)?;

        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let provider = Arc::new(provider_for(config)?);
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(protocol_versions(config)?)?;

        let server_config = match &config.ca_file {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(cert)?;
                }

                let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                if let Some(crl_path) = &config.crl_file {
                    verifier = verifier.with_crls(load_crls(crl_path)?);
                }
                if !config.require_client_cert {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier
                    .build()
                    .map_err(|e| TlsError::Verifier(e.to_string()))?;

                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        let username_source = if config.use_identity_as_username {
            UsernameSource::Identity
        } else if config.use_subject_as_username {
            UsernameSource::Subject
        } else {
            UsernameSource::None
        };

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            username_source,
            fingerprint,
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn username_source(&self) -> UsernameSource {
        self.username_source
    }

    pub fn fingerprint(&self) -> &TlsFingerprint {
        &self.fingerprint
    }
}

/// Snapshot of a TLS block and the modification times of its files.
///
/// Two equal fingerprints mean a reload would build the same context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFingerprint {
    config: TlsConfig,
    modified: Vec<Option<SystemTime>>,
}

impl TlsFingerprint {
    pub fn capture(config: &TlsConfig) -> Self {
        let modified = config
            .material_paths()
            .into_iter()
            .map(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
            .collect();
        Self {
            config: config.clone(),
            modified,
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertsFound(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKeyFound(path.to_path_buf()))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn protocol_versions(config: &TlsConfig) -> Result<&'static [&'static SupportedProtocolVersion], TlsError> {
    static ALL: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match config.tls_version_min.as_deref() {
        None | Some("tlsv1.2") => Ok(ALL),
        Some("tlsv1.3") => Ok(TLS13_ONLY),
        Some(other) => Err(TlsError::Version(other.to_string())),
    }
}

fn provider_for(config: &TlsConfig) -> Result<CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::ring::default_provider();
    let Some(list) = config.cipher_list.as_deref() else {
        return Ok(provider);
    };

    let wanted: Vec<&str> = list.split(':').map(str::trim).filter(|s| !s.is_empty()).collect();
    provider
        .cipher_suites
        .retain(|suite| wanted.iter().any(|name| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name)));
    if provider.cipher_suites.is_empty() {
        return Err(TlsError::NoMatchingCiphers(list.to_string()));
    }
    Ok(provider)
}

/// Username material extracted from a verified client certificate.
pub fn certificate_username(der: &CertificateDer<'_>, source: UsernameSource) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    match source {
        UsernameSource::None => None,
        UsernameSource::Identity => cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string),
        UsernameSource::Subject => Some(cert.subject().to_string()),
    }
}
