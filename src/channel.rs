//! Handler-facing connection handle

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::connection::Connection;
use crate::ws::{encoder, Frame};

/// Opaque handle the application uses to send data back to a peer.
///
/// Cheap to clone and safe to stash in handler-side state; it compares and
/// hashes by the connection it belongs to. All sends funnel into the
/// connection's `try_write`, so bytes reach the wire in call order. Sends
/// against a connection that has already closed are silently dropped.
#[derive(Debug, Clone)]
pub struct Channel {
    conn: Arc<Connection>,
}

impl Channel {
    pub(crate) fn new(conn: Arc<Connection>) -> Channel {
        Channel { conn }
    }

    /// Opaque id of the underlying connection, stable for its lifetime.
    pub fn id(&self) -> usize {
        self.conn.token().0
    }

    /// Queues raw buffers for delivery, in order. Callable from any thread.
    pub fn try_write(&self, bufs: Vec<Vec<u8>>) {
        self.conn.try_write(bufs);
    }

    /// Encodes a WebSocket frame and queues it for delivery.
    pub fn send_frame(&self, frame: &Frame) {
        self.try_write(encoder::encode(frame));
    }

    /// Prepares the next response cycle; called by the loop between
    /// requests.
    pub(crate) fn reset(&self) {
        self.conn.reset_response();
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.conn) as usize).hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.id())
    }
}
