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

//! Incremental WebSocket frame decoder

use crate::buffer::Buffer;

use super::{Frame, FrameError, OpCode, CLOSE_NORMAL};

/// Incremental server-side frame decoder.
///
/// Client frames must be masked. Fragmented data messages are assembled into
/// a single [`Frame::Text`]/[`Frame::Binary`]; control frames interleaved
/// between fragments are yielded as they arrive. The `max_message` limit
/// applies to single frames and to assembled messages alike.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Buffer,
    fragment: Option<Fragment>,
    max_message: usize,
}

#[derive(Debug)]
struct Fragment {
    text: bool,
    payload: Vec<u8>,
}

struct RawFrame {
    fin: bool,
    opcode: OpCode,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder enforcing `max_message` on frame and message sizes.
    pub fn new(max_message: usize) -> Self {
        FrameDecoder {
            buf: Buffer::new(),
            fragment: None,
            max_message,
        }
    }

    /// Creates a decoder seeded with bytes that were read together with the
    /// upgrade request.
    pub fn with_leftover(max_message: usize, leftover: Vec<u8>) -> Self {
        let mut decoder = FrameDecoder::new(max_message);
        decoder.buf.extend(&leftover);
        decoder
    }

    /// Appends freshly read bytes. The slice is copied; callers may reuse
    /// their read buffer immediately.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Whether undecoded bytes remain buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Attempts to decode one complete frame from the buffered bytes.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            let Some(raw) = self.next_raw_frame()? else {
                return Ok(None);
            };

            if raw.opcode.is_control() {
                return self.control_frame(raw).map(Some);
            }

            if let Some(frame) = self.data_frame(raw)? {
                return Ok(Some(frame));
            }
            // partial fragment absorbed, look for the next frame
        }
    }

    /// Parses one wire frame if it has fully arrived, unmasking the payload.
    fn next_raw_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        let bytes = self.buf.as_slice();
        if bytes.len() < 2 {
            return Ok(None);
        }

        if bytes[0] & 0x70 != 0 {
            // reserved bits are never negotiated
            return Err(FrameError::Protocol);
        }
        let fin = bytes[0] & 0x80 != 0;
        let opcode = OpCode::from_bits(bytes[0] & 0x0f).ok_or(FrameError::Protocol)?;

        if bytes[1] & 0x80 == 0 {
            // client frames must be masked
            return Err(FrameError::Protocol);
        }

        let (len, mut offset) = match bytes[1] & 0x7f {
            126 => {
                if bytes.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4)
            }
            127 => {
                if bytes.len() < 10 {
                    return Ok(None);
                }
                let mut be = [0u8; 8];
                be.copy_from_slice(&bytes[2..10]);
                let len = u64::from_be_bytes(be);
                if len > usize::MAX as u64 {
                    return Err(FrameError::TooBig);
                }
                (len as usize, 10)
            }
            n => (n as usize, 2),
        };

        if opcode.is_control() && (!fin || len > 125) {
            return Err(FrameError::Protocol);
        }
        if len > self.max_message {
            return Err(FrameError::TooBig);
        }

        if bytes.len() < offset + 4 + len {
            return Ok(None);
        }

        let mut key = [0u8; 4];
        key.copy_from_slice(&bytes[offset..offset + 4]);
        offset += 4;

        let mut payload = bytes[offset..offset + len].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }

        self.buf.consume(offset + len);
        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }

    fn control_frame(&mut self, raw: RawFrame) -> Result<Frame, FrameError> {
        match raw.opcode {
            OpCode::Ping => Ok(Frame::Ping(raw.payload)),
            OpCode::Pong => Ok(Frame::Pong(raw.payload)),
            OpCode::Close => close_frame(raw.payload),
            _ => unreachable!("data opcodes are not control frames"),
        }
    }

    fn data_frame(&mut self, raw: RawFrame) -> Result<Option<Frame>, FrameError> {
        match (raw.opcode, self.fragment.take()) {
            (OpCode::Continuation, Some(mut fragment)) => {
                if fragment.payload.len() + raw.payload.len() > self.max_message {
                    return Err(FrameError::TooBig);
                }
                fragment.payload.extend_from_slice(&raw.payload);
                if raw.fin {
                    finish_data(fragment.text, fragment.payload).map(Some)
                } else {
                    self.fragment = Some(fragment);
                    Ok(None)
                }
            }
            // continuation with no message in progress
            (OpCode::Continuation, None) => Err(FrameError::Protocol),
            // new data frame while a fragmented message is in progress
            (_, Some(_)) => Err(FrameError::Protocol),
            (opcode, None) => {
                let text = opcode == OpCode::Text;
                if raw.fin {
                    finish_data(text, raw.payload).map(Some)
                } else {
                    self.fragment = Some(Fragment {
                        text,
                        payload: raw.payload,
                    });
                    Ok(None)
                }
            }
        }
    }
}

fn finish_data(text: bool, payload: Vec<u8>) -> Result<Frame, FrameError> {
    if text {
        let text = String::from_utf8(payload).map_err(|_| FrameError::Protocol)?;
        Ok(Frame::Text(text))
    } else {
        Ok(Frame::Binary(payload))
    }
}

fn close_frame(payload: Vec<u8>) -> Result<Frame, FrameError> {
    match payload.len() {
        0 => Ok(Frame::Close {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }),
        1 => Err(FrameError::Protocol),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason =
                String::from_utf8(payload[2..].to_vec()).map_err(|_| FrameError::Protocol)?;
            Ok(Frame::Close { code, reason })
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{Frame, FrameError};
    use super::FrameDecoder;

    /// Builds a masked client frame.
    fn masked(fin_opcode: u8, payload: &[u8]) -> Vec<u8> {
        const KEY: [u8; 4] = [0x10, 0x20, 0x30, 0x40];
        let mut frame = vec![fin_opcode];
        if payload.len() > 125 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | payload.len() as u8);
        }
        frame.extend_from_slice(&KEY);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ KEY[i % 4]),
        );
        frame
    }

    #[test]
    fn decoder_needs_more_on_partial_frame() {
        let mut d = FrameDecoder::new(1024);
        let frame = masked(0x81, b"abc");
        d.feed(&frame[..4]);
        assert_eq!(Ok(None), d.decode());
        assert!(d.has_buffered());
    }

    #[test]
    fn decoder_yields_text_frame() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x81, b"abc"));
        assert_eq!(Ok(Some(Frame::Text("abc".into()))), d.decode());
        assert_eq!(Ok(None), d.decode());
    }

    #[test]
    fn decoder_yields_binary_frame() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x82, &[0, 159, 146, 150]));
        assert_eq!(Ok(Some(Frame::Binary(vec![0, 159, 146, 150]))), d.decode());
    }

    #[test]
    fn decoder_assembles_frame_across_feeds() {
        let mut d = FrameDecoder::new(1024);
        let frame = masked(0x81, b"hello");
        d.feed(&frame[..7]);
        assert_eq!(Ok(None), d.decode());
        d.feed(&frame[7..]);
        assert_eq!(Ok(Some(Frame::Text("hello".into()))), d.decode());
    }

    #[test]
    fn decoder_decodes_extended_length_frame() {
        let mut d = FrameDecoder::new(4096);
        let payload = vec![b'x'; 300];
        d.feed(&masked(0x82, &payload));
        assert_eq!(Ok(Some(Frame::Binary(payload))), d.decode());
    }

    #[test]
    fn decoder_yields_ping_payload() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x89, b"P"));
        assert_eq!(Ok(Some(Frame::Ping(b"P".to_vec()))), d.decode());
    }

    #[test]
    fn decoder_parses_close_code_and_reason() {
        let mut d = FrameDecoder::new(1024);
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        d.feed(&masked(0x88, &payload));
        assert_eq!(
            Ok(Some(Frame::Close {
                code: 1000,
                reason: "done".into()
            })),
            d.decode()
        );
    }

    #[test]
    fn decoder_defaults_empty_close_to_normal() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x88, b""));
        assert_eq!(
            Ok(Some(Frame::Close {
                code: 1000,
                reason: String::new()
            })),
            d.decode()
        );
    }

    #[test]
    fn decoder_assembles_fragmented_message() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x01, b"Hel"));
        d.feed(&masked(0x00, b"lo "));
        d.feed(&masked(0x80, b"World"));
        assert_eq!(Ok(Some(Frame::Text("Hello World".into()))), d.decode());
    }

    #[test]
    fn decoder_yields_control_between_fragments() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x01, b"He"));
        d.feed(&masked(0x89, b"ping"));
        d.feed(&masked(0x80, b"llo"));
        assert_eq!(Ok(Some(Frame::Ping(b"ping".to_vec()))), d.decode());
        assert_eq!(Ok(Some(Frame::Text("Hello".into()))), d.decode());
    }

    #[test]
    fn decoder_rejects_unmasked_client_frame() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&[0x81, 0x03, b'a', b'b', b'c']);
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_reserved_bits() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0xc1, b"x"));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_unknown_opcode() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x83, b"x"));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_fragmented_control_frame() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x09, b"x"));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_orphan_continuation() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x80, b"x"));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_interleaved_data_frame() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x01, b"He"));
        d.feed(&masked(0x81, b"oops"));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let mut d = FrameDecoder::new(4);
        d.feed(&masked(0x81, b"hello"));
        assert_eq!(Err(FrameError::TooBig), d.decode());
    }

    #[test]
    fn decoder_rejects_oversized_assembled_message() {
        let mut d = FrameDecoder::new(4);
        d.feed(&masked(0x01, b"abc"));
        d.feed(&masked(0x80, b"def"));
        assert_eq!(Err(FrameError::TooBig), d.decode());
    }

    #[test]
    fn decoder_rejects_invalid_utf8_text() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x81, &[0xff, 0xfe]));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_rejects_one_byte_close_payload() {
        let mut d = FrameDecoder::new(1024);
        d.feed(&masked(0x88, &[0x03]));
        assert_eq!(Err(FrameError::Protocol), d.decode());
    }

    #[test]
    fn decoder_starts_from_leftover_bytes() {
        let mut d = FrameDecoder::with_leftover(1024, masked(0x81, b"abc"));
        assert_eq!(Ok(Some(Frame::Text("abc".into()))), d.decode());
    }
}
