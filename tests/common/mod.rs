//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mqttd::config::TlsConfig;
use mqttd::net::connection::ConnectionTracker;
use mqttd::net::AcceptContext;
use mqttd::routing::{AcceptedConnection, ChannelCore};
use mqttd::security::{IdentityLookup, PassThrough};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const WAIT: Duration = Duration::from_secs(5);

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// True when `127.0.0.1:port` can be bound again.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub struct Harness {
    pub ctx: AcceptContext,
    pub tracker: ConnectionTracker,
    pub rx: mpsc::Receiver<AcceptedConnection>,
}

pub fn harness() -> Harness {
    harness_with_identity(Arc::new(PassThrough))
}

pub fn harness_with_identity(identity: Arc<dyn IdentityLookup>) -> Harness {
    let (core, rx) = ChannelCore::new(16);
    let tracker = ConnectionTracker::new();
    let ctx = AcceptContext {
        core: Arc::new(core),
        identity,
        tracker: tracker.clone(),
        handshake_timeout: Duration::from_secs(5),
    };
    Harness { ctx, tracker, rx }
}

/// Next connection handed to the core, failing the test after `WAIT`.
pub async fn next_connection(rx: &mut mpsc::Receiver<AcceptedConnection>) -> AcceptedConnection {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no connection handed off in time")
        .expect("core channel closed")
}

/// A CA plus server and client certificates signed by it, written as PEM files.
pub struct Pki {
    pub dir: PathBuf,
    pub ca_file: PathBuf,
    pub ca_der: CertificateDer<'static>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub client_cert: CertificateDer<'static>,
    pub client_key: Vec<u8>,
}

impl Pki {
    pub fn generate(dir: &Path, tag: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = DistinguishedName::new();
        ca_params.distinguished_name.push(DnType::CommonName, "mqttd test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params.distinguished_name = DistinguishedName::new();
        client_params.distinguished_name.push(DnType::CommonName, "sensor-1");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

        let ca_file = dir.join(format!("{tag}-ca.pem"));
        let cert_file = dir.join(format!("{tag}-server.pem"));
        let key_file = dir.join(format!("{tag}-server.key"));
        std::fs::write(&ca_file, ca_cert.pem()).unwrap();
        std::fs::write(&cert_file, server_cert.pem()).unwrap();
        std::fs::write(&key_file, server_key.serialize_pem()).unwrap();

        Self {
            dir: dir.to_path_buf(),
            ca_file,
            ca_der: ca_cert.der().clone(),
            cert_file,
            key_file,
            client_cert: client_cert.der().clone(),
            client_key: client_key.serialize_der(),
        }
    }

    /// Server-only TLS block.
    pub fn server_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: Some(self.cert_file.clone()),
            key_file: Some(self.key_file.clone()),
            ..TlsConfig::default()
        }
    }

    /// TLS block requiring a client certificate whose CN becomes the username.
    pub fn mutual_tls(&self) -> TlsConfig {
        TlsConfig {
            ca_file: Some(self.ca_file.clone()),
            require_client_cert: true,
            use_identity_as_username: true,
            ..self.server_tls()
        }
    }

    fn connector(&self, with_client_cert: bool) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        let config = if with_client_cert {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key.clone()));
            builder
                .with_client_auth_cert(vec![self.client_cert.clone()], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        TlsConnector::from(Arc::new(config))
    }

    pub async fn connect(&self, addr: SocketAddr, with_client_cert: bool) -> std::io::Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(addr).await?;
        self.handshake(tcp, with_client_cert).await
    }

    /// TLS client handshake over an already connected socket.
    pub async fn handshake(&self, tcp: TcpStream, with_client_cert: bool) -> std::io::Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from("localhost").unwrap();
        self.connector(with_client_cert).connect(name, tcp).await
    }
}
