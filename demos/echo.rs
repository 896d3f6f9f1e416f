//! Echo server: answers HTTP requests with their own path and echoes
//! WebSocket frames back to the peer.
//!
//! ```sh
//! cargo run --example echo
//! curl http://127.0.0.1:8090/hello
//! ```

use std::io::Result;
use std::sync::Arc;
use std::thread;

use log::info;
use skiff::http::{Request, Response, Status};
use skiff::ws::{handshake, Frame};
use skiff::{Channel, Handler, Responder, Server, ServerConfig};

struct Echo;

impl Handler for Echo {
    fn handle_request(&self, request: Request, responder: Responder) {
        if request.is_upgrade() {
            if let Some(response) = handshake::upgrade_response(&request) {
                responder.send(response);
            }
            return;
        }

        responder.send(
            Response::new(Status::Ok)
                .header("Content-Type", "text/plain")
                .body(request.target.clone()),
        );
    }

    fn handle_frame(&self, channel: &Channel, frame: Frame) {
        channel.send_frame(&frame);
    }

    fn client_close(&self, channel: &Channel, status: i32) {
        info!("{} closed with status {}", channel, status);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut server = Server::bind(ServerConfig::default(), Arc::new(Echo))?;
    server.start()?;
    info!("listening on {}", server.local_addr());

    loop {
        thread::park();
    }
}
