//! Bound listeners and their accept loops.
//!
//! # Responsibilities
//! - Load TLS material, then open the listener's sockets
//! - Accept connections and enforce the client limit
//! - Run TLS / WebSocket handshakes off the accept loop, under a timeout
//! - Hand established connections to the routing core
//! - Hot-swap the TLS context without touching the sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ListenerConfig, TlsConfig};
use crate::net::connection::{ClientSlot, ClientSlots, ConnectionTracker, SessionGuard};
use crate::net::stream::{ByteStream, ClientStream, PeerAddr};
use crate::net::tls::{certificate_username, TlsContext, TlsError, TlsFingerprint, UsernameSource};
use crate::net::transport::{BindError, HandshakeError, ListenSocket, Transport};
use crate::observability::metrics;
use crate::routing::{AcceptedConnection, RoutingCore};
use crate::security::IdentityLookup;

/// Pause after a failed `accept` so fd exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

static LISTENER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a bound listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(LISTENER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What every accept task needs besides its socket.
#[derive(Clone)]
pub struct AcceptContext {
    pub core: Arc<dyn RoutingCore>,
    pub identity: Arc<dyn IdentityLookup>,
    pub tracker: ConnectionTracker,
    pub handshake_timeout: Duration,
}

/// Point-in-time view of a listener for the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListenerStatus {
    pub id: String,
    pub endpoint: String,
    pub protocol: String,
    pub addresses: Vec<String>,
    pub tls: bool,
    pub clients: usize,
    pub max_clients: Option<usize>,
    pub serving: bool,
}

struct Shared {
    id: ListenerId,
    key: String,
    config: Arc<ListenerConfig>,
    transport: Transport,
    tls: Option<ArcSwap<TlsContext>>,
    slots: ClientSlots,
    serving: AtomicBool,
    ctx: AcceptContext,
}

/// Cheap read-only view of a listener, for status reporting.
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
    addresses: Arc<[String]>,
}

impl ListenerHandle {
    pub fn status(&self) -> ListenerStatus {
        let shared = &self.shared;
        ListenerStatus {
            id: shared.id.to_string(),
            endpoint: shared.key.clone(),
            protocol: shared.config.protocol.to_string(),
            addresses: self.addresses.to_vec(),
            tls: shared.tls.is_some(),
            clients: shared.slots.current(),
            max_clients: shared.slots.max(),
            serving: shared.serving.load(Ordering::SeqCst),
        }
    }
}

/// A listener with open sockets, owned by the `ListenerManager`.
pub struct BoundListener {
    index: usize,
    shared: Arc<Shared>,
    sockets: Vec<Arc<ListenSocket>>,
    addresses: Arc<[String]>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BoundListener {
    /// Load TLS material and open every socket for `config`.
    ///
    /// Nothing stays open when this fails.
    pub fn bind(
        index: usize,
        config: Arc<ListenerConfig>,
        global_limit: Option<usize>,
        ctx: AcceptContext,
    ) -> Result<Self, BindError> {
        let transport = Transport::for_config(&config);
        let tls = match &config.tls {
            Some(tls) if tls.cert_file.is_some() || tls.psk_hint.is_none() => {
                if tls.psk_hint.is_some() {
                    tracing::warn!(endpoint = %config.endpoint_key(), "psk_hint ignored, PSK is not supported alongside certificates");
                }
                Some(ArcSwap::from_pointee(TlsContext::load(tls)?))
            }
            _ => None,
        };

        let sockets = transport.bind(&config)?;
        let addresses: Arc<[String]> = sockets.iter().map(|s| s.describe()).collect();

        let id = ListenerId::next();
        let key = config.endpoint_key();
        let max = config.connection_limit(global_limit);
        let slots = ClientSlots::new(max).with_gauge(metrics::listener_clients(&key));

        tracing::info!(
            listener = %id,
            index,
            endpoint = %key,
            addresses = ?addresses,
            tls = tls.is_some(),
            max_connections = ?max,
            "Listener bound"
        );

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            index,
            shared: Arc::new(Shared {
                id,
                key,
                config,
                transport,
                tls,
                slots,
                serving: AtomicBool::new(false),
                ctx,
            }),
            sockets: sockets.into_iter().map(Arc::new).collect(),
            addresses,
            stop_tx,
            tasks: Vec::new(),
        })
    }

    pub fn id(&self) -> ListenerId {
        self.shared.id
    }

    /// Position in the configuration this listener was bound from.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.shared.config
    }

    pub fn endpoint_key(&self) -> &str {
        &self.shared.key
    }

    pub fn is_serving(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().filter_map(|s| s.local_addr()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.shared.slots.current()
    }

    /// The TLS context new handshakes will use.
    pub fn tls_context(&self) -> Option<Arc<TlsContext>> {
        self.shared.tls.as_ref().map(|cell| cell.load_full())
    }

    /// Spawn one accept task per socket. No-op when already serving.
    pub fn serve(&mut self) {
        if self.is_serving() {
            return;
        }
        for socket in &self.sockets {
            let task = tokio::spawn(accept_loop(
                Arc::clone(socket),
                Arc::clone(&self.shared),
                self.stop_tx.subscribe(),
            ));
            self.tasks.push(task);
        }
        self.shared.serving.store(!self.tasks.is_empty(), Ordering::SeqCst);
    }

    /// Stop accepting and close every socket. Accepted streams are unaffected.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() && self.sockets.is_empty() {
            return;
        }
        let _ = self.stop_tx.send(true);
        self.shared.serving.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(listener = %self.shared.id, error = %e, "Accept task ended abnormally");
            }
        }
        for socket in self.sockets.drain(..) {
            remove_socket_file(&socket);
        }
        tracing::info!(listener = %self.shared.id, endpoint = %self.shared.key, "Listener stopped");
    }

    /// Rebuild the TLS context if the TLS block or its files changed.
    ///
    /// Returns whether a new context was swapped in. Handshakes already in
    /// progress keep the context they started with.
    pub fn reload_tls(&self, tls: &TlsConfig) -> Result<bool, TlsError> {
        let Some(cell) = &self.shared.tls else {
            return Ok(false);
        };
        if *cell.load().fingerprint() == TlsFingerprint::capture(tls) {
            return Ok(false);
        }
        let fresh = TlsContext::load(tls)?;
        cell.store(Arc::new(fresh));
        tracing::info!(listener = %self.shared.id, endpoint = %self.shared.key, "TLS context reloaded");
        Ok(true)
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shared: Arc::clone(&self.shared),
            addresses: Arc::clone(&self.addresses),
        }
    }

    pub fn status(&self) -> ListenerStatus {
        self.handle().status()
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        for socket in &self.sockets {
            remove_socket_file(socket);
        }
    }
}

fn remove_socket_file(socket: &ListenSocket) {
    if let Some(path) = socket.unix_path() {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove unix socket"),
        }
    }
}

async fn accept_loop(socket: Arc<ListenSocket>, shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    tracing::debug!(listener = %shared.id, address = %socket.describe(), "Accept loop started");
    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            result = socket.accept() => match result {
                Ok((stream, peer)) => {
                    let Some(slot) = shared.slots.try_claim() else {
                        tracing::warn!(
                            listener = %shared.id,
                            %peer,
                            max_connections = ?shared.slots.max(),
                            "Connection limit reached, closing"
                        );
                        metrics::on_connection_rejected(&shared.key, "limit");
                        continue;
                    };
                    // One load per connection; a reload mid-handshake does not affect it.
                    let tls = shared.tls.as_ref().map(|cell| cell.load_full());
                    tokio::spawn(handle_connection(Arc::clone(&shared), stream, peer, slot, tls));
                }
                Err(e) => {
                    tracing::warn!(listener = %shared.id, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!(listener = %shared.id, address = %socket.describe(), "Accept loop stopped");
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: ByteStream,
    peer: PeerAddr,
    slot: ClientSlot,
    tls: Option<Arc<TlsContext>>,
) {
    let outcome = tokio::time::timeout(shared.ctx.handshake_timeout, establish(&shared, stream, tls)).await;
    let (stream, username) = match outcome {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            tracing::debug!(listener = %shared.id, %peer, error = %e, "Handshake failed");
            metrics::on_connection_rejected(&shared.key, e.reason());
            return;
        }
        Err(_) => {
            tracing::debug!(listener = %shared.id, %peer, "Handshake timed out");
            metrics::on_connection_rejected(&shared.key, HandshakeError::Timeout.reason());
            return;
        }
    };

    let session = SessionGuard::new(shared.ctx.tracker.track(), slot);
    tracing::debug!(
        listener = %shared.id,
        connection_id = %session.id(),
        %peer,
        username = ?username,
        "Connection established"
    );
    metrics::on_connection_accepted(&shared.key);

    shared.ctx.core.accept(AcceptedConnection {
        listener_id: shared.id,
        protocol: shared.config.protocol,
        peer,
        username,
        max_qos: shared.config.max_qos,
        max_topic_alias: shared.config.max_topic_alias,
        stream,
        session,
    });
}

async fn establish(
    shared: &Shared,
    stream: ByteStream,
    tls: Option<Arc<TlsContext>>,
) -> Result<(ClientStream, Option<String>), HandshakeError> {
    let (stream, identity) = match tls {
        Some(ctx) => terminate_tls(stream, &ctx).await?,
        None => (stream, None),
    };
    let username = match identity {
        Some(identity) => Some(shared.ctx.identity.lookup(&identity).ok_or(HandshakeError::Rejected)?),
        None => None,
    };
    let stream = shared.transport.wrap(stream, &shared.config).await?;
    Ok((stream, username))
}

async fn terminate_tls(stream: ByteStream, ctx: &TlsContext) -> Result<(ByteStream, Option<String>), HandshakeError> {
    let ByteStream::Tcp(tcp) = stream else {
        return Err(HandshakeError::Unsupported);
    };
    let tls = ctx.acceptor().accept(tcp).await.map_err(HandshakeError::Tls)?;

    let source = ctx.username_source();
    if source == UsernameSource::None {
        return Ok((ByteStream::Tls(Box::new(tls)), None));
    }
    let identity = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| certificate_username(cert, source))
        .ok_or(HandshakeError::Rejected)?;
    Ok((ByteStream::Tls(Box::new(tls)), Some(identity)))
}
