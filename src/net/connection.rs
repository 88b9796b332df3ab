//! Connection accounting: listener client slots and the session drain tracker.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::Gauge;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-listener client counter with an optional ceiling.
#[derive(Clone)]
pub struct ClientSlots {
    limit: Option<Arc<Semaphore>>,
    max: Option<usize>,
    current: Arc<AtomicUsize>,
    gauge: Gauge,
}

impl std::fmt::Debug for ClientSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSlots")
            .field("max", &self.max)
            .field("current", &self.current())
            .finish()
    }
}

impl ClientSlots {
    pub fn new(max: Option<usize>) -> Self {
        Self {
            limit: max.map(|m| Arc::new(Semaphore::new(m))),
            max,
            current: Arc::new(AtomicUsize::new(0)),
            gauge: Gauge::noop(),
        }
    }

    /// Mirror the client count into a metrics gauge.
    pub fn with_gauge(mut self, gauge: Gauge) -> Self {
        self.gauge = gauge;
        self
    }

    /// Claim a slot, or `None` when the listener is full.
    pub fn try_claim(&self) -> Option<ClientSlot> {
        let permit = match &self.limit {
            Some(sem) => Some(Arc::clone(sem).try_acquire_owned().ok()?),
            None => None,
        };
        self.current.fetch_add(1, Ordering::SeqCst);
        self.gauge.increment(1.0);
        Some(ClientSlot {
            _permit: permit,
            current: Arc::clone(&self.current),
            gauge: self.gauge.clone(),
        })
    }

    /// Clients currently connected through this listener.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }
}

/// A claimed client slot. Released on drop.
pub struct ClientSlot {
    _permit: Option<OwnedSemaphorePermit>,
    current: Arc<AtomicUsize>,
    gauge: Gauge,
}

impl std::fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientSlot")
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.gauge.decrement(1.0);
    }
}

/// Counts sessions owned by the routing core so shutdown can wait for them.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    open: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self {
            open: Arc::new(watch::Sender::new(0)),
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. It counts as open until the guard is dropped.
    pub fn track(&self) -> ConnectionGuard {
        self.open.send_modify(|n| *n += 1);
        ConnectionGuard {
            open: Arc::clone(&self.open),
            id: ConnectionId::next(),
        }
    }

    pub fn active_count(&self) -> usize {
        *self.open.borrow()
    }

    /// Resolves once no session is open.
    pub async fn wait_for_drain(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<watch::Sender<usize>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(session = %self.id, "Session released");
    }
}

/// Everything a live session holds on to: its listener slot and its entry in
/// the drain tracker. Dropping it ends the session's accounting.
#[derive(Debug)]
pub struct SessionGuard {
    tracked: ConnectionGuard,
    _slot: ClientSlot,
}

impl SessionGuard {
    pub fn new(tracked: ConnectionGuard, slot: ClientSlot) -> Self {
        Self { tracked, _slot: slot }
    }

    pub fn id(&self) -> ConnectionId {
        self.tracked.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn tracked_sessions_get_distinct_ids() {
        let tracker = ConnectionTracker::new();
        let sessions: Vec<_> = (0..3).map(|_| tracker.track()).collect();
        assert_eq!(tracker.active_count(), 3);
        assert_ne!(sessions[0].id(), sessions[1].id());
        assert!(sessions[2].id().as_u64() > sessions[1].id().as_u64());

        drop(sessions);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_returns_at_once_when_idle() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_for_drain())
            .await
            .unwrap();
    }

    #[test]
    fn slots_enforce_limit() {
        let slots = ClientSlots::new(Some(2));
        let a = slots.try_claim().unwrap();
        let _b = slots.try_claim().unwrap();
        assert!(slots.try_claim().is_none());
        assert_eq!(slots.current(), 2);

        drop(a);
        assert_eq!(slots.current(), 1);
        assert!(slots.try_claim().is_some());
    }

    #[test]
    fn unlimited_slots_still_count() {
        let slots = ClientSlots::new(None);
        let claimed: Vec<_> = (0..100).map(|_| slots.try_claim().unwrap()).collect();
        assert_eq!(slots.current(), 100);
        drop(claimed);
        assert_eq!(slots.current(), 0);
    }

    #[test]
    fn session_guard_releases_slot_and_tracker() {
        let slots = ClientSlots::new(Some(1));
        let tracker = ConnectionTracker::new();
        let session = SessionGuard::new(tracker.track(), slots.try_claim().unwrap());
        assert_eq!(tracker.active_count(), 1);
        assert!(slots.try_claim().is_none());

        drop(session);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(slots.current(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_drain().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
