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

//! Incremental HTTP/1.x request decoder

use crate::buffer::Buffer;

use super::{DecodeError, Method, Request, Version};

/// Incremental request decoder.
///
/// Bytes are appended with [`RequestDecoder::feed`]; [`RequestDecoder::decode`]
/// consumes them and yields a complete [`Request`] once the head and body have
/// fully arrived, or `None` when more bytes are needed. Bytes beyond a
/// complete request stay buffered for the next decode call, so several
/// requests read in one packet are parsed one at a time.
#[derive(Debug)]
pub struct RequestDecoder {
    buf: Buffer,
    state: State,
    max_line: usize,
    max_body: usize,
}

#[derive(Debug)]
enum State {
    Head,
    FixedBody {
        head: Head,
        body: Vec<u8>,
        remaining: usize,
    },
    ChunkSize {
        head: Head,
        body: Vec<u8>,
    },
    ChunkData {
        head: Head,
        body: Vec<u8>,
        remaining: usize,
    },
    ChunkTrailer {
        head: Head,
        body: Vec<u8>,
    },
}

#[derive(Debug)]
struct Head {
    method: Method,
    target: String,
    version: Version,
    headers: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
enum Framing {
    None,
    ContentLength(usize),
    Chunked,
}

impl RequestDecoder {
    /// Creates a decoder enforcing the given request-line and body limits.
    pub fn new(max_line: usize, max_body: usize) -> Self {
        RequestDecoder {
            buf: Buffer::new(),
            state: State::Head,
            max_line,
            max_body,
        }
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

    /// Surrenders buffered bytes that were read past the last complete
    /// request, for hand-off to a successor decoder after an upgrade.
    pub fn into_remaining(mut self) -> Vec<u8> {
        self.buf.take()
    }

    /// Attempts to decode one complete request from the buffered bytes.
    pub fn decode(&mut self) -> Result<Option<Request>, DecodeError> {
        loop {
            match std::mem::replace(&mut self.state, State::Head) {
                State::Head => match self.parse_head()? {
                    Some((head, Framing::None)) => {
                        return Ok(Some(finish(head, Vec::new())));
                    }
                    Some((head, Framing::ContentLength(len))) => {
                        if len > self.max_body {
                            return Err(DecodeError::BodyTooLarge);
                        }
                        self.state = State::FixedBody {
                            head,
                            body: Vec::with_capacity(len),
                            remaining: len,
                        };
                    }
                    Some((head, Framing::Chunked)) => {
                        self.state = State::ChunkSize {
                            head,
                            body: Vec::new(),
                        };
                    }
                    None => return Ok(None),
                },
                State::FixedBody {
                    head,
                    mut body,
                    remaining,
                } => {
                    let available = self.buf.remaining().min(remaining);
                    body.extend_from_slice(&self.buf.as_slice()[..available]);
                    self.buf.consume(available);

                    if available == remaining {
                        return Ok(Some(finish(head, body)));
                    }
                    self.state = State::FixedBody {
                        head,
                        body,
                        remaining: remaining - available,
                    };
                    return Ok(None);
                }
                State::ChunkSize { head, body } => {
                    let Some(line_end) = find_crlf(self.buf.as_slice()) else {
                        if self.buf.remaining() > self.max_line {
                            return Err(DecodeError::Malformed);
                        }
                        self.state = State::ChunkSize { head, body };
                        return Ok(None);
                    };

                    let size = parse_chunk_size(&self.buf.as_slice()[..line_end])?;
                    self.buf.consume(line_end + 2);

                    if size == 0 {
                        self.state = State::ChunkTrailer { head, body };
                    } else if body.len() + size > self.max_body {
                        return Err(DecodeError::BodyTooLarge);
                    } else {
                        self.state = State::ChunkData {
                            head,
                            body,
                            remaining: size,
                        };
                    }
                }
                State::ChunkData {
                    head,
                    mut body,
                    remaining,
                } => {
                    let available = self.buf.remaining().min(remaining);
                    body.extend_from_slice(&self.buf.as_slice()[..available]);
                    self.buf.consume(available);

                    if available < remaining {
                        self.state = State::ChunkData {
                            head,
                            body,
                            remaining: remaining - available,
                        };
                        return Ok(None);
                    }

                    // chunk data is terminated by CRLF
                    if self.buf.remaining() < 2 {
                        self.state = State::ChunkData {
                            head,
                            body,
                            remaining: 0,
                        };
                        return Ok(None);
                    }
                    if &self.buf.as_slice()[..2] != b"\r\n" {
                        return Err(DecodeError::Malformed);
                    }
                    self.buf.consume(2);
                    self.state = State::ChunkSize { head, body };
                }
                State::ChunkTrailer { head, body } => {
                    let Some(line_end) = find_crlf(self.buf.as_slice()) else {
                        if self.buf.remaining() > self.max_line {
                            return Err(DecodeError::Malformed);
                        }
                        self.state = State::ChunkTrailer { head, body };
                        return Ok(None);
                    };

                    self.buf.consume(line_end + 2);
                    if line_end == 0 {
                        return Ok(Some(finish(head, body)));
                    }
                    // discard trailer field and keep scanning for the blank line
                    self.state = State::ChunkTrailer { head, body };
                }
            }
        }
    }

    /// Parses the head section if the terminating blank line has arrived.
    fn parse_head(&mut self) -> Result<Option<(Head, Framing)>, DecodeError> {
        let bytes = self.buf.as_slice();

        let Some(head_end) = find_head_end(bytes) else {
            // the unterminated tail bounds every in-flight line
            let tail = match bytes.iter().rposition(|&b| b == b'\n') {
                Some(pos) => bytes.len() - pos - 1,
                None => bytes.len(),
            };
            if tail > self.max_line {
                return Err(DecodeError::LineTooLong);
            }
            return Ok(None);
        };

        let head = parse_head_section(&bytes[..head_end], self.max_line)?;
        self.buf.consume(head_end + 4);

        let framing = framing(&head)?;
        Ok(Some((head, framing)))
    }
}

fn finish(head: Head, body: Vec<u8>) -> Request {
    let keep_alive = keep_alive(&head);
    let upgrade = upgrade(&head);
    Request {
        method: head.method,
        target: head.target,
        version: head.version,
        body,
        headers: head.headers,
        keep_alive,
        upgrade,
        remote_addr: None,
        channel: None,
    }
}

/// Position of the first CRLF, if present.
fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

/// Position of the blank line terminating the head section.
fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head_section(head: &[u8], max_line: usize) -> Result<Head, DecodeError> {
    let mut lines = head.split(|&b| b == b'\n').map(|line| {
        // every line but the last still carries its CR
        line.strip_suffix(b"\r").unwrap_or(line)
    });

    let request_line = lines.next().ok_or(DecodeError::Malformed)?;
    if request_line.len() > max_line {
        return Err(DecodeError::LineTooLong);
    }
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.len() > max_line {
            return Err(DecodeError::LineTooLong);
        }
        headers.push(parse_header_line(line)?);
    }

    Ok(Head {
        method,
        target,
        version,
        headers,
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), DecodeError> {
    let mut parts = line.split(|&b| b == b' ');

    let method = parts
        .next()
        .and_then(Method::from_bytes)
        .ok_or(DecodeError::Malformed)?;

    let target = parts.next().ok_or(DecodeError::Malformed)?;
    if target.is_empty() || !target.iter().all(|&b| is_target_token(b)) {
        return Err(DecodeError::Malformed);
    }
    let target = String::from_utf8(target.to_vec()).map_err(|_| DecodeError::Malformed)?;

    let version = match parts.next() {
        Some(b"HTTP/1.0") => Version::H1_0,
        Some(b"HTTP/1.1") => Version::H1_1,
        _ => return Err(DecodeError::Malformed),
    };

    if parts.next().is_some() {
        return Err(DecodeError::Malformed);
    }

    Ok((method, target, version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), DecodeError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(DecodeError::Malformed)?;

    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_header_name_token(b)) {
        return Err(DecodeError::Malformed);
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|&b| b < b' ' && b != b'\t') {
        return Err(DecodeError::Malformed);
    }

    let name = String::from_utf8(name.to_vec()).map_err(|_| DecodeError::Malformed)?;
    let value = String::from_utf8(value.to_vec()).map_err(|_| DecodeError::Malformed)?;
    Ok((name, value))
}

fn framing(head: &Head) -> Result<Framing, DecodeError> {
    if let Some(te) = header(head, "Transfer-Encoding") {
        if te
            .split(',')
            .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(Framing::Chunked);
        }
        return Err(DecodeError::Malformed);
    }

    match header(head, "Content-Length") {
        Some(value) => {
            let len: usize = value.trim().parse().map_err(|_| DecodeError::Malformed)?;
            if len == 0 {
                Ok(Framing::None)
            } else {
                Ok(Framing::ContentLength(len))
            }
        }
        None => Ok(Framing::None),
    }
}

fn keep_alive(head: &Head) -> bool {
    let connection = header(head, "Connection").unwrap_or("");
    match head.version {
        Version::H1_1 => !connection_has(connection, "close"),
        Version::H1_0 => connection_has(connection, "keep-alive"),
    }
}

fn upgrade(head: &Head) -> bool {
    header(head, "Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
        && connection_has(header(head, "Connection").unwrap_or(""), "upgrade")
        && header(head, "Sec-WebSocket-Key").is_some()
}

fn header<'a>(head: &'a Head, name: &str) -> Option<&'a str> {
    head.headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn connection_has(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, DecodeError> {
    // chunk extensions after ';' are ignored
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = std::str::from_utf8(digits).map_err(|_| DecodeError::Malformed)?;
    usize::from_str_radix(digits.trim(), 16).map_err(|_| DecodeError::Malformed)
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// RFC 9112 request-target characters: visible ASCII.
fn is_target_token(b: u8) -> bool {
    (b'!'..=b'~').contains(&b)
}

/// RFC 9110 field-name token characters.
fn is_header_name_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod test {
    use super::super::{DecodeError, Method, Version};
    use super::RequestDecoder;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(1024, 4096)
    }

    #[test]
    fn decoder_needs_more_on_partial_head() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.1\r\nHost: x");
        assert!(d.decode().unwrap().is_none());
    }

    #[test]
    fn decoder_yields_complete_request() {
        let mut d = decoder();
        d.feed(b"GET /a/b?q=1 HTTP/1.1\r\nHost: example.org\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(Method::Get, req.method);
        assert_eq!("/a/b?q=1", req.target);
        assert_eq!(Version::H1_1, req.version);
        assert_eq!(Some("example.org"), req.header("host"));
        assert!(req.keep_alive());
        assert!(!req.is_upgrade());
    }

    #[test]
    fn decoder_assembles_head_across_feeds() {
        let mut d = decoder();
        d.feed(b"POST /submit HT");
        assert!(d.decode().unwrap().is_none());
        d.feed(b"TP/1.1\r\nContent-Le");
        assert!(d.decode().unwrap().is_none());
        d.feed(b"ngth: 5\r\n\r\nhello");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(Method::Post, req.method);
        assert_eq!(b"hello".to_vec(), req.body);
    }

    #[test]
    fn decoder_reads_fixed_body_across_feeds() {
        let mut d = decoder();
        d.feed(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n01234");
        assert!(d.decode().unwrap().is_none());
        d.feed(b"56789");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(b"0123456789".to_vec(), req.body);
    }

    #[test]
    fn decoder_parses_back_to_back_requests_one_at_a_time() {
        let mut d = decoder();
        d.feed(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        let first = d.decode().unwrap().unwrap();
        assert_eq!("/a", first.target);
        assert!(d.has_buffered());
        let second = d.decode().unwrap().unwrap();
        assert_eq!("/b", second.target);
        assert!(d.decode().unwrap().is_none());
    }

    #[test]
    fn decoder_http_1_0_defaults_to_close() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn decoder_http_1_0_honors_keep_alive_header() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert!(req.keep_alive());
    }

    #[test]
    fn decoder_http_1_1_honors_connection_close() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn decoder_detects_websocket_upgrade() {
        let mut d = decoder();
        d.feed(
            b"GET /chat HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: keep-alive, Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        let req = d.decode().unwrap().unwrap();
        assert!(req.is_upgrade());
    }

    #[test]
    fn decoder_upgrade_requires_websocket_key() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert!(!req.is_upgrade());
    }

    #[test]
    fn decoder_decodes_chunked_body() {
        let mut d = decoder();
        d.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        d.feed(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(b"Wikipedia".to_vec(), req.body);
    }

    #[test]
    fn decoder_decodes_chunked_body_split_mid_chunk() {
        let mut d = decoder();
        d.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nabc");
        assert!(d.decode().unwrap().is_none());
        d.feed(b"def\r\n0\r\n");
        assert!(d.decode().unwrap().is_none());
        d.feed(b"\r\n");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(b"abcdef".to_vec(), req.body);
    }

    #[test]
    fn decoder_discards_chunked_trailers() {
        let mut d = decoder();
        d.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        d.feed(b"3\r\nabc\r\n0\r\nExpires: never\r\n\r\n");
        let req = d.decode().unwrap().unwrap();
        assert_eq!(b"abc".to_vec(), req.body);
    }

    #[test]
    fn decoder_rejects_declared_body_over_limit() {
        let mut d = RequestDecoder::new(1024, 8);
        d.feed(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n");
        assert_eq!(Err(DecodeError::BodyTooLarge), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_chunked_body_over_limit() {
        let mut d = RequestDecoder::new(1024, 8);
        d.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n9\r\n012345678\r\n0\r\n\r\n");
        assert_eq!(Err(DecodeError::BodyTooLarge), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_overlong_request_line() {
        let mut d = RequestDecoder::new(16, 4096);
        d.feed(b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\n\r\n");
        assert_eq!(Err(DecodeError::LineTooLong), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_unterminated_overlong_line_early() {
        let mut d = RequestDecoder::new(16, 4096);
        d.feed(b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(Err(DecodeError::LineTooLong), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_unknown_method() {
        let mut d = decoder();
        d.feed(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(Err(DecodeError::Malformed), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_bad_version() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/2.0\r\n\r\n");
        assert_eq!(Err(DecodeError::Malformed), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_header_without_colon() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.1\r\nHost example.org\r\n\r\n");
        assert_eq!(Err(DecodeError::Malformed), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_rejects_bad_content_length() {
        let mut d = decoder();
        d.feed(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(Err(DecodeError::Malformed), d.decode().map(|_| ()));
    }

    #[test]
    fn decoder_surrenders_bytes_past_a_request() {
        let mut d = decoder();
        d.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\x81\x80\x00\x00\x00\x00");
        let _ = d.decode().unwrap().unwrap();
        assert_eq!(
            b"\x81\x80\x00\x00\x00\x00".to_vec(),
            d.into_remaining()
        );
    }
}
