//! Pending-wake queue
//!
//! Handler threads never touch the poller. When a write needs the event
//! loop's attention they push the connection's token here and unblock the
//! selector; the loop drains the queue at the top of each iteration.
//! Multiple wakeups coalesce into a single selector return.

use std::fmt;
use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use mio::{Registry, Token, Waker};

pub(crate) struct WakeQueue {
    tx: Sender<Token>,
    waker: Waker,
}

impl fmt::Debug for WakeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeQueue")
            .field("pending", &self.tx.len())
            .finish()
    }
}

impl WakeQueue {
    /// Creates the queue and its loop-side receiver, registering the waker
    /// under `token`.
    pub fn new(registry: &Registry, token: Token) -> io::Result<(Arc<WakeQueue>, Receiver<Token>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let waker = Waker::new(registry, token)?;
        Ok((Arc::new(WakeQueue { tx, waker }), rx))
    }

    /// Enqueues `token` for attention and unblocks the selector. Callable
    /// from any thread.
    pub fn push(&self, token: Token) {
        if self.tx.send(token).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Unblocks the selector without enqueueing a token.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}
