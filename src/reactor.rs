//! The event loop
//!
//! A single thread owns the poller, the connection table and the scratch
//! buffer. Every interest-set mutation happens here; handler threads reach
//! the loop only through the pending-wake queue. Connection keys alternate
//! between read and write interest, so a readiness event is never both.

use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{debug, error, warn};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

use crate::channel::Channel;
use crate::connection::{Connection, Inner, Phase};
use crate::handler::{Handler, Responder};
use crate::http::{DecodeError, Request, RequestDecoder, Response, Status};
use crate::wake::WakeQueue;
use crate::ws::{self, encoder, Frame, FrameDecoder, FrameError};

pub(crate) const LISTEN_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Loop-owned read buffer, reused across connections within one iteration.
/// Decoders copy what they keep; no slice of it survives a read dispatch.
const SCRATCH_CAPACITY: usize = 64 * 1024;

const EVENT_CAPACITY: usize = 1024;

/// The single-threaded reactor: acceptor, read/write pipelines and close
/// policy.
pub(crate) struct Reactor {
    listener: TcpListener,
    poll: Poll,
    entries: Slab<Entry>,
    handler: Arc<dyn Handler>,
    wake: Arc<WakeQueue>,
    wake_rx: Receiver<Token>,
    shutdown: Arc<AtomicBool>,
    scratch: Box<[u8]>,
    max_line: usize,
    max_body: usize,
}

/// Loop-private state for one connection: the shared attachment plus the
/// phase decoder and the registration bit, which only the loop touches.
struct Entry {
    conn: Arc<Connection>,
    phase: Phase,
    registered: bool,
}

enum Step {
    Request(Request),
    Frame(Frame),
    HttpError(DecodeError),
    WsError(FrameError),
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        poll: Poll,
        handler: Arc<dyn Handler>,
        wake: Arc<WakeQueue>,
        wake_rx: Receiver<Token>,
        shutdown: Arc<AtomicBool>,
        max_line: usize,
        max_body: usize,
    ) -> Reactor {
        Reactor {
            listener,
            poll,
            entries: Slab::new(),
            handler,
            wake,
            wake_rx,
            shutdown,
            scratch: vec![0u8; SCRATCH_CAPACITY].into_boxed_slice(),
            max_line,
            max_body,
        }
    }

    /// Runs the event loop until `stop()` or selector failure. One iteration:
    /// drain the pending-wake queue, block in the selector, dispatch ready
    /// keys.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.shutdown_all();
                return;
            }
            self.drain_wake();

            match self.poll.poll(&mut events, None) {
                Ok(()) => {
                    for event in events.iter() {
                        // a fault in one connection (or a panicking handler)
                        // must not take the loop down
                        let guarded = panic::catch_unwind(AssertUnwindSafe(|| {
                            match event.token() {
                                LISTEN_TOKEN => self.accept(),
                                // the queue is drained at the top of the iteration
                                WAKE_TOKEN => {}
                                token => self.dispatch(token, event),
                            }
                        }));
                        if guarded.is_err() {
                            error!("panic while dispatching {:?}, continuing", event.token());
                        }
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("selector failed, reactor stopping: {}", err);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        // the key may have closed while an earlier event in this batch ran
        if event.is_readable() && self.entries.contains(token.0) {
            self.do_read(token);
        }
        if event.is_writable() && self.entries.contains(token.0) {
            self.do_write(token);
        }
    }

    /// Drains the listening socket, registering each accepted socket for
    /// read readiness with a fresh HTTP attachment. Accept failures are
    /// logged and swallowed; the listener stays up.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.entries.vacant_entry();
                    let token = Token(entry.key());

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("dropping connection from {}: {}", peer, err);
                        continue;
                    }

                    let conn = Connection::new(token, peer, stream, self.wake.clone());
                    entry.insert(Entry {
                        conn,
                        phase: Phase::Http(RequestDecoder::new(self.max_line, self.max_body)),
                        registered: true,
                    });
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Reads the socket into the scratch buffer and feeds the phase decoder
    /// until the socket runs dry, the connection pauses, or it closes.
    fn do_read(&mut self, token: Token) {
        loop {
            let Some(entry) = self.entries.get(token.0) else { return };
            let conn = entry.conn.clone();

            let read = {
                let mut inner = conn.lock();
                if inner.closed {
                    return;
                }
                inner.stream.read(&mut self.scratch[..])
            };

            match read {
                Ok(0) => return self.close_key(token, i32::from(ws::CLOSE_AWAY)),
                Ok(n) => {
                    if let Some(entry) = self.entries.get_mut(token.0) {
                        match &mut entry.phase {
                            Phase::Http(decoder) => decoder.feed(&self.scratch[..n]),
                            Phase::Ws(decoder) => decoder.feed(&self.scratch[..n]),
                        }
                    }
                    self.drive(token);

                    // a dispatched request pauses reads; bytes still in the
                    // kernel re-surface when interest is re-registered
                    let Some(entry) = self.entries.get(token.0) else { return };
                    if entry.conn.lock().in_flight {
                        return;
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(_) => return self.close_key(token, i32::from(ws::CLOSE_AWAY)),
            }
        }
    }

    /// Decodes complete units out of the phase decoder and acts on them.
    fn drive(&mut self, token: Token) {
        loop {
            let step = {
                let Some(entry) = self.entries.get_mut(token.0) else { return };
                match &mut entry.phase {
                    Phase::Http(decoder) => {
                        if entry.conn.lock().in_flight {
                            // previous response still pending, hold decoding
                            return;
                        }
                        match decoder.decode() {
                            Ok(Some(request)) => Step::Request(request),
                            Ok(None) => return,
                            Err(err) => Step::HttpError(err),
                        }
                    }
                    Phase::Ws(decoder) => match decoder.decode() {
                        Ok(Some(frame)) => Step::Frame(frame),
                        Ok(None) => return,
                        Err(err) => Step::WsError(err),
                    },
                }
            };

            match step {
                Step::Request(request) => {
                    self.on_request(token, request);
                    // reads stay paused until the response fully drains
                    return;
                }
                Step::Frame(frame) => self.on_frame(token, frame),
                Step::HttpError(err) => return self.on_http_error(token, err),
                Step::WsError(err) => {
                    return self.close_key(token, i32::from(err.close_code()));
                }
            }
        }
    }

    /// Hands a complete request to the handler: resets the channel, applies
    /// keep-alive or swaps in the WebSocket attachment, pauses reads, binds
    /// the peer address and channel.
    fn on_request(&mut self, token: Token, mut request: Request) {
        let Some(entry) = self.entries.get_mut(token.0) else { return };
        let conn = entry.conn.clone();
        let channel = Channel::new(conn.clone());
        channel.reset();

        if request.is_upgrade() {
            // the attachment swaps variants; bytes the old decoder read past
            // the upgrade request seed the new one
            let placeholder = Phase::Ws(FrameDecoder::new(self.max_body));
            if let Phase::Http(decoder) = std::mem::replace(&mut entry.phase, placeholder) {
                entry.phase = Phase::Ws(FrameDecoder::with_leftover(
                    self.max_body,
                    decoder.into_remaining(),
                ));
            }
        }

        {
            let mut inner = conn.lock();
            if !request.is_upgrade() {
                inner.keep_alive = request.keep_alive();
            }
            inner.in_flight = true;
            if entry.registered {
                if let Err(err) = self.poll.registry().deregister(&mut inner.stream) {
                    warn!("failed to pause reads on {}: {}", token.0, err);
                }
                entry.registered = false;
            }
        }

        request.remote_addr = Some(conn.peer());
        request.channel = Some(channel.clone());
        self.handler.handle_request(request, Responder::new(channel));
    }

    /// Acts on one decoded WebSocket frame. Pings and Closes are answered
    /// here; data frames go to the handler.
    fn on_frame(&mut self, token: Token, frame: Frame) {
        let Some(entry) = self.entries.get(token.0) else { return };
        let conn = entry.conn.clone();
        let channel = Channel::new(conn.clone());

        match frame {
            Frame::Text(_) | Frame::Binary(_) => self.handler.handle_frame(&channel, frame),
            Frame::Ping(payload) => conn.try_write(encoder::encode(&Frame::Pong(payload))),
            // unsolicited pongs are permitted and carry no obligation
            Frame::Pong(_) => {}
            Frame::Close { code, .. } => {
                if conn.mark_close_notified() {
                    self.handler.client_close(&channel, i32::from(code));
                }
                // echo the close; the socket stays open until peer EOF or stop
                conn.try_write(encoder::encode(&Frame::Close {
                    code,
                    reason: String::new(),
                }));
            }
        }
    }

    fn on_http_error(&mut self, token: Token, err: DecodeError) {
        debug!("request decode failed on {}: {}", token.0, err);
        match err {
            DecodeError::Malformed => self.close_key(token, -1),
            DecodeError::BodyTooLarge => self.limit_response(token, Status::ContentTooLarge),
            DecodeError::LineTooLong => self.limit_response(token, Status::UriTooLong),
        }
    }

    /// Answers a limit violation with a canned response and marks the
    /// connection to close once it drains.
    fn limit_response(&mut self, token: Token, status: Status) {
        let Some(entry) = self.entries.get_mut(token.0) else { return };
        let conn = entry.conn.clone();

        {
            let mut inner = conn.lock();
            inner.keep_alive = false;
            inner.in_flight = true;
            if entry.registered {
                let _ = self.poll.registry().deregister(&mut inner.stream);
                entry.registered = false;
            }
        }

        conn.try_write(Response::new(status).encode());
    }

    /// Drains the outbound queue on write readiness.
    fn do_write(&mut self, token: Token) {
        let Some(entry) = self.entries.get(token.0) else { return };
        let conn = entry.conn.clone();

        let result = {
            let mut inner = conn.lock();
            if inner.closed {
                return;
            }
            inner.write_outbound()
        };

        match result {
            Ok(()) => self.after_drain(token),
            Err(err) => {
                debug!("write failed on {}: {}", token.0, err);
                self.close_key(token, i32::from(ws::CLOSE_AWAY));
            }
        }
    }

    /// Settles a connection after its queue state changed: arm write
    /// interest for residuals, close a drained non-keep-alive key, or
    /// resume reads and flush decoder-buffered requests.
    fn after_drain(&mut self, token: Token) {
        enum Next {
            Close(i32),
            Resume,
            Stay,
        }

        let next = {
            let Some(entry) = self.entries.get_mut(token.0) else { return };
            let conn = entry.conn.clone();
            let mut inner = conn.lock();

            if inner.closed {
                Next::Stay
            } else if inner.broken {
                Next::Close(i32::from(ws::CLOSE_AWAY))
            } else if !inner.outbound.is_empty() {
                arm(
                    self.poll.registry(),
                    &mut inner,
                    token,
                    Interest::WRITABLE,
                    &mut entry.registered,
                );
                Next::Stay
            } else if !inner.keep_alive {
                Next::Close(i32::from(ws::CLOSE_NORMAL))
            } else if inner.in_flight && !conn.responded() {
                // the handler has not produced the response yet
                Next::Stay
            } else {
                let resume = inner.in_flight;
                inner.in_flight = false;
                arm(
                    self.poll.registry(),
                    &mut inner,
                    token,
                    Interest::READABLE,
                    &mut entry.registered,
                );
                if resume {
                    Next::Resume
                } else {
                    Next::Stay
                }
            }
        };

        match next {
            Next::Close(status) => self.close_key(token, status),
            // a pipelined request may already sit decoded in the buffer
            Next::Resume => self.drive(token),
            Next::Stay => {}
        }
    }

    /// Drains the pending-wake queue. Tokens whose keys have since closed
    /// are ignored.
    fn drain_wake(&mut self) {
        while let Ok(token) = self.wake_rx.try_recv() {
            if self.entries.contains(token.0) {
                let guarded = panic::catch_unwind(AssertUnwindSafe(|| self.after_drain(token)));
                if guarded.is_err() {
                    error!("panic while settling {}, continuing", token.0);
                }
            }
        }
    }

    /// Uniform close path: tears the socket down and reports the end to the
    /// handler exactly once. HTTP-phase closes report -1; WebSocket-phase
    /// closes report `status`.
    fn close_key(&mut self, token: Token, status: i32) {
        if !self.entries.contains(token.0) {
            return;
        }
        let entry = self.entries.remove(token.0);

        {
            let mut inner = entry.conn.lock();
            inner.closed = true;
            inner.outbound.clear();
            if entry.registered {
                let _ = self.poll.registry().deregister(&mut inner.stream);
            }
            let _ = inner.stream.shutdown(Shutdown::Both);
        }

        let status = match entry.phase {
            Phase::Http(_) => -1,
            Phase::Ws(_) => status,
        };

        if entry.conn.mark_close_notified() {
            let channel = Channel::new(entry.conn.clone());
            self.handler.client_close(&channel, status);
        }
        debug!("connection {} closed with status {}", token.0, status);
    }

    /// Closes every tracked connection and tells the handler the server is
    /// going down.
    fn shutdown_all(&mut self) {
        debug!("reactor stopping, closing {} connections", self.entries.len());
        let tokens: Vec<Token> = self.entries.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close_key(token, i32::from(ws::CLOSE_AWAY));
        }
        self.handler.close();
    }
}

/// Registers or re-registers interest. Registration state is loop-owned, so
/// this runs only on the reactor thread.
fn arm(
    registry: &Registry,
    inner: &mut Inner,
    token: Token,
    interest: Interest,
    registered: &mut bool,
) {
    let result = if *registered {
        registry.reregister(&mut inner.stream, token, interest)
    } else {
        registry.register(&mut inner.stream, token, interest)
    };
    match result {
        Ok(()) => *registered = true,
        Err(err) => warn!("failed to arm interest on {}: {}", token.0, err),
    }
}
