// Copyright 2024 the skiff authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! skiff is a lightweight event-driven HTTP/1.1 and WebSocket server core.
//!
//! A single reactor thread owns the selector, accepts connections, decodes
//! requests and frames, and drains responses. Application handlers run
//! wherever the application wants; they reach the wire through a [`Channel`]
//! or [`Responder`], which may be used from any thread while the reactor
//! keeps per-connection bytes in order.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use skiff::http::{Request, Response, Status};
//! use skiff::ws::{handshake, Frame};
//! use skiff::{Channel, Handler, Responder, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn handle_request(&self, request: Request, responder: Responder) {
//!         if request.is_upgrade() {
//!             if let Some(response) = handshake::upgrade_response(&request) {
//!                 responder.send(response);
//!             }
//!             return;
//!         }
//!         responder.send(Response::new(Status::Ok).body(request.target.clone()));
//!     }
//!
//!     fn handle_frame(&self, channel: &Channel, frame: Frame) {
//!         channel.send_frame(&frame);
//!     }
//!
//!     fn client_close(&self, _channel: &Channel, _status: i32) {}
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let mut server = Server::bind(ServerConfig::default(), Arc::new(Echo))?;
//!     server.start()?;
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```

mod buffer;
mod channel;
mod connection;
mod handler;
mod reactor;
mod server;
mod wake;

pub mod http;
pub mod ws;

pub use channel::Channel;
pub use handler::{Handler, Responder};
pub use server::{Server, ServerConfig};
