use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{ConnectionClosed, EventBus};
use crate::metered::TrafficCounters;

/// Process-wide source of connection identifiers.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one accepted connection.
///
/// Identifiers are monotonic across the whole process, so two connections
/// never compare equal even across server instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn next_for_tests() -> Self {
        Self::next()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte totals for one connection.
///
/// Source figures are measured on the accepted socket; target figures come
/// from the counting wrappers handlers install on outbound sockets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub src_tx_bytes: u64,
    pub src_rx_bytes: u64,
    pub trg_tx_bytes: u64,
    pub trg_rx_bytes: u64,
}

impl ConnectionStats {
    pub fn total(&self) -> u64 {
        self.src_tx_bytes + self.src_rx_bytes + self.trg_tx_bytes + self.trg_rx_bytes
    }
}

struct ConnectionEntry {
    src: Arc<TrafficCounters>,
    trg: Arc<TrafficCounters>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            src_tx_bytes: self.src.tx(),
            src_rx_bytes: self.src.rx(),
            trg_tx_bytes: self.trg.tx(),
            trg_rx_bytes: self.trg.rx(),
        }
    }
}

/// Per-connection handle held by the serving task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    pub src: Arc<TrafficCounters>,
    pub trg: Arc<TrafficCounters>,
    pub cancel: CancellationToken,
}

/// Live-connection table; the single source of truth for shutdown.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a newly accepted socket and returns its handle.
    pub(crate) fn register(&self) -> ConnectionHandle {
        let id = ConnectionId::next();
        let src = Arc::new(TrafficCounters::default());
        let trg = Arc::new(TrafficCounters::default());
        let cancel = CancellationToken::new();
        self.lock().insert(
            id,
            ConnectionEntry {
                src: src.clone(),
                trg: trg.clone(),
                cancel: cancel.clone(),
            },
        );
        ConnectionHandle {
            id,
            src,
            trg,
            cancel,
        }
    }

    /// Current counters for a live connection, or `None` once it is gone.
    pub fn stats_for(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.lock().get(&id).map(ConnectionEntry::stats)
    }

    /// Snapshot of the live connection identifiers.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forces teardown of every live connection.
    ///
    /// The live set is snapshotted before any cancellation so close handlers
    /// removing entries never race the iteration.
    pub fn destroy_all(&self) {
        let tokens: Vec<CancellationToken> =
            self.lock().values().map(|entry| entry.cancel.clone()).collect();
        debug!("destroying {} pending connections", tokens.len());
        for token in tokens {
            token.cancel();
        }
    }

    /// Captures final stats, emits `connectionClosed`, then removes the
    /// entry, in that order.
    pub(crate) fn finish(&self, id: ConnectionId, events: &EventBus) {
        let Some(stats) = self.stats_for(id) else {
            return;
        };
        let payload = (stats.total() > 0).then_some(stats);
        events.emit_connection_closed(ConnectionClosed {
            connection_id: id,
            stats: payload,
        });
        self.lock().remove(&id);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let registry = ConnectionRegistry::new();
        let events = EventBus::new();
        let handle = registry.register();
        assert_eq!(registry.ids(), vec![handle.id]);
        assert_eq!(registry.stats_for(handle.id), Some(ConnectionStats::default()));

        registry.finish(handle.id, &events);
        assert!(registry.ids().is_empty());
        assert!(registry.stats_for(handle.id).is_none());
    }

    #[test]
    fn finish_is_idempotent_and_emits_once() {
        let registry = ConnectionRegistry::new();
        let events = EventBus::new();
        let mut rx = events.subscribe_connection_closed();
        let handle = registry.register();
        handle.src.add_rx(10);

        registry.finish(handle.id, &events);
        registry.finish(handle.id, &events);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.connection_id, handle.id);
        assert_eq!(event.stats.unwrap().src_rx_bytes, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn finish_without_traffic_has_no_stats_payload() {
        let registry = ConnectionRegistry::new();
        let events = EventBus::new();
        let mut rx = events.subscribe_connection_closed();
        let handle = registry.register();

        registry.finish(handle.id, &events);
        assert!(rx.try_recv().unwrap().stats.is_none());
    }

    #[test]
    fn destroy_all_cancels_every_connection() {
        let registry = ConnectionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert!(!a.cancel.is_cancelled());

        registry.destroy_all();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
    }

    #[test]
    fn identifiers_never_repeat() {
        let registry = ConnectionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.id, b.id);
        assert!(a.id < b.id);
    }
}
