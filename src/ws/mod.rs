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

//! RFC 6455 WebSocket frame model and codecs

use std::fmt::Display;

pub mod decoder;
pub mod encoder;
pub mod handshake;

pub use decoder::FrameDecoder;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (peer hangup, server shutdown).
pub const CLOSE_AWAY: u16 = 1001;
/// Protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Message too big to process.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// A complete WebSocket frame, with fragmented messages already assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Ping control frame.
    Ping(Vec<u8>),
    /// Pong control frame.
    Pong(Vec<u8>),
    /// Close control frame. `code` defaults to 1000 when the peer sent an
    /// empty close payload.
    Close {
        /// Close status code.
        code: u16,
        /// Optional UTF-8 close reason.
        reason: String,
    },
}

/// Failures surfaced by the frame decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The bytes violate RFC 6455 framing rules.
    Protocol,
    /// A frame or assembled message exceeded the configured limit.
    TooBig,
}

impl FrameError {
    /// Close code reported to the peer's handler for this error.
    pub fn close_code(self) -> u16 {
        match self {
            FrameError::Protocol => CLOSE_PROTOCOL_ERROR,
            FrameError::TooBig => CLOSE_MESSAGE_TOO_BIG,
        }
    }
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FrameError::Protocol => "WebSocket protocol violation",
            FrameError::TooBig => "WebSocket message too big",
        })
    }
}

impl std::error::Error for FrameError {}

/// Frame opcodes
/// [RFC 6455 Section 5.2](https://www.rfc-editor.org/rfc/rfc6455#section-5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    pub(crate) fn from_bits(bits: u8) -> Option<OpCode> {
        match bits {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xa => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub(crate) fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}
