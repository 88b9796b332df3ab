//! Channel-backed core: connections are forwarded over a bounded mpsc queue.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{AcceptedConnection, RoutingCore};

/// Forwards accepted connections to whoever holds the receiver.
#[derive(Debug)]
pub struct ChannelCore {
    tx: Mutex<Option<mpsc::Sender<AcceptedConnection>>>,
}

impl ChannelCore {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AcceptedConnection>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }
}

impl RoutingCore for ChannelCore {
    fn accept(&self, conn: AcceptedConnection) {
        let Ok(guard) = self.tx.lock() else {
            return;
        };
        let Some(tx) = guard.as_ref() else {
            tracing::debug!(peer = %conn.peer, "Core drained, dropping connection");
            return;
        };
        if let Err(e) = tx.try_send(conn) {
            let conn = match e {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            };
            tracing::warn!(
                listener = %conn.listener_id,
                peer = %conn.peer,
                "Routing core not accepting connections, closing"
            );
        }
    }

    /// Closes the channel; the receiver sees `None` once the queue is empty.
    fn drain(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}
