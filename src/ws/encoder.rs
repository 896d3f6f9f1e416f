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

//! Server-side frame encoding

use super::{Frame, OpCode};

/// Serializes a frame to a gather-writable buffer sequence: the frame header
/// and, when non-empty, the payload. Server frames are unmasked and sent
/// unfragmented with FIN set.
pub fn encode(frame: &Frame) -> Vec<Vec<u8>> {
    let (opcode, payload) = match frame {
        Frame::Text(text) => (OpCode::Text, text.as_bytes().to_vec()),
        Frame::Binary(data) => (OpCode::Binary, data.clone()),
        Frame::Ping(data) => (OpCode::Ping, data.clone()),
        Frame::Pong(data) => (OpCode::Pong, data.clone()),
        Frame::Close { code, reason } => {
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            (OpCode::Close, payload)
        }
    };

    let mut header = Vec::with_capacity(10);
    header.push(0x80 | opcode as u8);

    match payload.len() {
        len if len <= 125 => header.push(len as u8),
        len if len <= u16::MAX as usize => {
            header.push(126);
            header.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            header.push(127);
            header.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    if payload.is_empty() {
        vec![header]
    } else {
        vec![header, payload]
    }
}
