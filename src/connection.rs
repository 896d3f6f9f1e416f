//! Per-connection attachment
//!
//! One mutex guards everything `try_write` and the event loop contend on:
//! the socket, the outbound queue and the keep-alive/in-flight flags.
//! Decoder state is deliberately absent here; it is owned by the loop and
//! lives in the reactor's connection table.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, IoSlice, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mio::net::TcpStream;
use mio::Token;

use crate::http::RequestDecoder;
use crate::wake::WakeQueue;
use crate::ws::FrameDecoder;

/// Protocol phase of a connection. Monotonic: Http becomes Ws at most once,
/// on a successful upgrade, and never reverts.
#[derive(Debug)]
pub(crate) enum Phase {
    Http(RequestDecoder),
    Ws(FrameDecoder),
}

/// An outbound buffer, possibly partially written.
#[derive(Debug)]
pub(crate) struct OutBuf {
    data: Vec<u8>,
    pos: usize,
}

impl OutBuf {
    fn new(data: Vec<u8>) -> Self {
        OutBuf { data, pos: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

const MAX_WRITE_SLICES: usize = 64;

/// State shared between the event loop and handler threads.
#[derive(Debug)]
pub(crate) struct Inner {
    pub stream: TcpStream,
    pub outbound: VecDeque<OutBuf>,
    pub keep_alive: bool,
    /// An HTTP request has been dispatched and its response has not fully
    /// drained; reads are paused meanwhile.
    pub in_flight: bool,
    /// The close path ran; all further I/O on this connection is a no-op.
    pub closed: bool,
    /// A write from a handler thread failed; the loop closes the key with
    /// a went-away status on its next pass.
    pub broken: bool,
}

impl Inner {
    /// Gather-writes the outbound queue until it is empty or the socket
    /// stops accepting bytes. Fully written buffers drop off the front; a
    /// partially written one stays with its position advanced.
    pub fn write_outbound(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            let slices: Vec<IoSlice<'_>> = self
                .outbound
                .iter()
                .take(MAX_WRITE_SLICES)
                .map(|buf| IoSlice::new(buf.remaining()))
                .collect();

            match self.stream.write_vectored(&slices) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => advance_queue(&mut self.outbound, n),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// The attachment bound to one accepted socket.
#[derive(Debug)]
pub(crate) struct Connection {
    token: Token,
    peer: SocketAddr,
    wake: Arc<WakeQueue>,
    /// Latch making the response callback single-shot per request cycle.
    responded: AtomicBool,
    /// The handler has been told this connection is gone.
    close_notified: AtomicBool,
    inner: Mutex<Inner>,
}

impl Connection {
    pub fn new(
        token: Token,
        peer: SocketAddr,
        stream: TcpStream,
        wake: Arc<WakeQueue>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            token,
            peer,
            wake,
            responded: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                stream,
                outbound: VecDeque::new(),
                keep_alive: true,
                in_flight: false,
                closed: false,
                broken: false,
            }),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock leaves only byte-level state; the
        // close path still runs fine against it
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Queues `bufs` for delivery, writing inline when nothing is pending.
    /// Callable from any thread; append order is wire order. Writes against
    /// a closed connection are swallowed.
    pub fn try_write(&self, bufs: Vec<Vec<u8>>) {
        let mut pending: VecDeque<OutBuf> = bufs
            .into_iter()
            .filter(|buf| !buf.is_empty())
            .map(OutBuf::new)
            .collect();
        if pending.is_empty() {
            return;
        }

        let mut inner = self.lock();
        if inner.closed {
            return;
        }

        let mut notify = true;
        if inner.outbound.is_empty() {
            // fast path: one optimistic gather-write, residuals queued
            loop {
                let slices: Vec<IoSlice<'_>> = pending
                    .iter()
                    .take(MAX_WRITE_SLICES)
                    .map(|buf| IoSlice::new(buf.remaining()))
                    .collect();

                match inner.stream.write_vectored(&slices) {
                    Ok(n) => {
                        advance_queue(&mut pending, n);
                        break;
                    }
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(_) => {
                        inner.broken = true;
                        pending.clear();
                        break;
                    }
                }
            }

            if pending.is_empty() && !inner.broken {
                // fully written; the loop only needs to hear about it when
                // it must close the key or resume paused reads
                notify = !inner.keep_alive || inner.in_flight;
            } else {
                inner.outbound.append(&mut pending);
            }
        } else {
            // a queue exists, so the loop owns the drain; never write inline
            // past it or the wire would reorder
            inner.outbound.append(&mut pending);
        }

        drop(inner);
        if notify {
            self.wake.push(self.token);
        }
    }

    /// Arms the response latch. Returns true for the first call of the
    /// current request cycle.
    pub fn mark_responded(&self) -> bool {
        !self.responded.swap(true, Ordering::AcqRel)
    }

    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Clears the response latch for the next request cycle.
    pub fn reset_response(&self) {
        self.responded.store(false, Ordering::Release);
    }

    /// Latches the close notification. Returns true for the first call; the
    /// handler hears about a connection's end exactly once.
    pub fn mark_close_notified(&self) -> bool {
        !self.close_notified.swap(true, Ordering::AcqRel)
    }
}

/// Drops `written` bytes from the front of the queue, retaining a partially
/// written buffer with its position advanced.
fn advance_queue(queue: &mut VecDeque<OutBuf>, mut written: usize) {
    while written > 0 {
        let Some(front) = queue.front_mut() else { return };
        let len = front.remaining().len();
        if written >= len {
            written -= len;
            queue.pop_front();
        } else {
            front.pos += written;
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::{advance_queue, OutBuf};

    fn queue(bufs: &[&[u8]]) -> VecDeque<OutBuf> {
        bufs.iter().map(|b| OutBuf::new(b.to_vec())).collect()
    }

    #[test]
    fn advance_queue_drops_fully_written_buffers() {
        let mut q = queue(&[b"abc", b"de"]);
        advance_queue(&mut q, 3);
        assert_eq!(1, q.len());
        assert_eq!(b"de", q[0].remaining());
    }

    #[test]
    fn advance_queue_retains_partial_front() {
        let mut q = queue(&[b"abcde"]);
        advance_queue(&mut q, 2);
        assert_eq!(b"cde", q[0].remaining());
    }

    #[test]
    fn advance_queue_spans_buffer_boundary() {
        let mut q = queue(&[b"ab", b"cdef"]);
        advance_queue(&mut q, 4);
        assert_eq!(1, q.len());
        assert_eq!(b"ef", q[0].remaining());
    }

    #[test]
    fn advance_queue_empties_on_exact_total() {
        let mut q = queue(&[b"ab", b"cd"]);
        advance_queue(&mut q, 4);
        assert!(q.is_empty());
    }
}
