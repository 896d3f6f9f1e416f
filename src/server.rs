//! Server construction and lifecycle

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use mio::net::TcpListener;
use mio::{Interest, Poll};

use crate::handler::Handler;
use crate::reactor::{Reactor, LISTEN_TOKEN, WAKE_TOKEN};
use crate::wake::WakeQueue;

/// Construction parameters for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, an IP or a resolvable name.
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Upper bound on a request body (and on a WebSocket message), in bytes.
    pub max_body: usize,
    /// Upper bound on the request line and each header line, in bytes.
    pub max_line: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_body: 8 * 1024 * 1024,
            max_line: 4 * 1024,
        }
    }
}

/// A bound server owning one reactor thread.
///
/// [`Server::bind`] claims the socket, [`Server::start`] spawns the reactor,
/// [`Server::stop`] closes every connection, notifies the handler and joins
/// the thread. Stop also runs on drop.
pub struct Server {
    reactor: Option<Reactor>,
    thread: Option<JoinHandle<()>>,
    wake: Arc<WakeQueue>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the listening socket and assembles the reactor around
    /// `handler`.
    pub fn bind(config: ServerConfig, handler: Arc<dyn Handler>) -> io::Result<Server> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, "bind address resolved to nothing")
            })?;

        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let (wake, wake_rx) = WakeQueue::new(poll.registry(), WAKE_TOKEN)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let reactor = Reactor::new(
            listener,
            poll,
            handler,
            wake.clone(),
            wake_rx,
            shutdown.clone(),
            config.max_line,
            config.max_body,
        );

        Ok(Server {
            reactor: Some(reactor),
            thread: None,
            wake,
            shutdown,
            local_addr,
        })
    }

    /// Spawns the reactor thread, named for diagnostics.
    pub fn start(&mut self) -> io::Result<()> {
        let mut reactor = self
            .reactor
            .take()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "server already started"))?;

        let thread = thread::Builder::new()
            .name("skiff-reactor".to_string())
            .spawn(move || reactor.run())?;
        self.thread = Some(thread);
        debug!("server listening on {}", self.local_addr);
        Ok(())
    }

    /// Address the listener is bound to; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the server: the reactor closes the listener and every tracked
    /// socket, notifies the handler of shutdown and exits. In-flight handler
    /// work is not awaited. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // never started: releases the socket
        self.reactor = None;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("running", &self.thread.is_some())
            .finish()
    }
}
