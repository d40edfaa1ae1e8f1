use std::sync::Arc;

use http::Method;
use tokio::sync::broadcast;

use crate::error::HandlerError;
use crate::registry::{ConnectionId, ConnectionStats};

/// Summary of the request attached to failure events.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub connection_id: ConnectionId,
    pub method: Method,
    pub target: String,
}

/// A request failed with an error the proxy could not map to a client
/// status; the client was answered with 500.
#[derive(Debug, Clone)]
pub struct RequestFailed {
    pub error: Arc<HandlerError>,
    pub request: RequestSummary,
}

/// A client connection finished; `stats` carries the final byte totals, or
/// is absent when no data flowed at all.
#[derive(Debug, Clone)]
pub struct ConnectionClosed {
    pub connection_id: ConnectionId,
    pub stats: Option<ConnectionStats>,
}

/// Observation channels for embedding code. The two event kinds are
/// independent; a subscriber to one never sees the other.
pub struct EventBus {
    request_failed: broadcast::Sender<RequestFailed>,
    connection_closed: broadcast::Sender<ConnectionClosed>,
}

impl EventBus {
    pub fn new() -> Self {
        let (request_failed, _) = broadcast::channel(64);
        let (connection_closed, _) = broadcast::channel(64);
        Self {
            request_failed,
            connection_closed,
        }
    }

    pub fn subscribe_request_failed(&self) -> broadcast::Receiver<RequestFailed> {
        self.request_failed.subscribe()
    }

    pub fn subscribe_connection_closed(&self) -> broadcast::Receiver<ConnectionClosed> {
        self.connection_closed.subscribe()
    }

    pub(crate) fn emit_request_failed(&self, event: RequestFailed) {
        let _ = self.request_failed.send(event);
    }

    pub(crate) fn emit_connection_closed(&self, event: ConnectionClosed) {
        let _ = self.connection_closed.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
