//! Application handler contract

use crate::channel::Channel;
use crate::http::{Request, Response};
use crate::ws::Frame;

/// The application boundary of the reactor.
///
/// All methods are invoked on the reactor thread; implementations that do
/// real work should hand it off to their own threads and must never block.
/// Responses and frames may be sent from any thread via the [`Responder`]
/// or the [`Channel`].
pub trait Handler: Send + Sync {
    /// Called for each complete HTTP request, including WebSocket upgrade
    /// requests (check [`Request::is_upgrade`] and answer with
    /// [`crate::ws::handshake::upgrade_response`]). Reads on the connection
    /// pause until the responder has been used and the response has fully
    /// drained.
    fn handle_request(&self, request: Request, responder: Responder);

    /// Called for each complete Text or Binary WebSocket frame, with
    /// fragmented messages already assembled. Ping and Close frames are
    /// answered by the core and do not reach the handler here.
    fn handle_frame(&self, channel: &Channel, frame: Frame);

    /// Called exactly once when a connection ends. `status` is `-1` for
    /// HTTP-phase connections, otherwise a WebSocket close code: the peer's
    /// own code for a clean close, [`crate::ws::CLOSE_AWAY`] for hangups
    /// and server shutdown, or the code matching a framing error.
    fn client_close(&self, channel: &Channel, status: i32);

    /// Called once when the server stops.
    fn close(&self) {}
}

/// Single-use callback carrying one HTTP response back to its connection.
///
/// The first send wins; later sends on the same request cycle are inert.
/// Dropping the responder without sending leaves the connection paused
/// (there is no request timeout in the core).
#[derive(Debug)]
pub struct Responder {
    channel: Channel,
}

impl Responder {
    pub(crate) fn new(channel: Channel) -> Responder {
        Responder { channel }
    }

    /// The channel this response belongs to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Encodes and sends the response. Callable from any thread.
    pub fn send(self, response: Response) {
        if self.channel.connection().mark_responded() {
            self.channel.try_write(response.encode());
        }
    }
}
