//! Session-holding core used by the `mqttd` binary.
//!
//! Keeps each connection open, discarding inbound data, until the client
//! disconnects or the core is drained. A real deployment replaces it with the
//! packet-handling engine behind the same trait.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::io::AsyncReadExt;

use super::{AcceptedConnection, RoutingCore};
use crate::lifecycle::Shutdown;
use crate::net::stream::ClientStream;

#[derive(Default)]
pub struct HoldingCore {
    shutdown: Shutdown,
    drained: AtomicBool,
}

impl HoldingCore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingCore for HoldingCore {
    fn accept(&self, conn: AcceptedConnection) {
        if self.drained.load(Ordering::SeqCst) {
            tracing::debug!(peer = %conn.peer, "Core drained, dropping connection");
            return;
        }
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let AcceptedConnection {
                listener_id,
                peer,
                username,
                mut stream,
                session,
                ..
            } = conn;
            tracing::debug!(
                listener = %listener_id,
                session = %session.id(),
                %peer,
                username = ?username,
                websocket = stream.is_websocket(),
                "Session opened"
            );

            tokio::select! {
                _ = shutdown.wait() => {}
                _ = read_until_closed(&mut stream) => {}
            }

            tracing::debug!(session = %session.id(), %peer, "Session closed");
            drop(session);
        });
    }

    fn drain(&self) {
        self.drained.store(true, Ordering::SeqCst);
        self.shutdown.trigger();
    }
}

async fn read_until_closed(stream: &mut ClientStream) {
    match stream {
        ClientStream::Stream(s) => {
            let mut buf = [0u8; 4096];
            while matches!(s.read(&mut buf).await, Ok(n) if n > 0) {}
        }
        ClientStream::WebSocket(ws) => while let Some(Ok(_)) = ws.next().await {},
    }
}
