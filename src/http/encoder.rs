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

//! Response model and wire encoding

use std::io::Write;

use super::Status;

/// An HTTP/1.1 response under construction.
#[derive(Debug)]
pub struct Response {
    status: Status,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn new(status: Status) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header field.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Response status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Serializes to a gather-writable buffer sequence: the head and, when
    /// non-empty, the body. `Content-Length` is filled in unless the caller
    /// set one or the status forbids a body.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut head = Vec::with_capacity(128);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        );

        let mut has_length = false;
        for (name, value) in &self.headers {
            has_length |= name.eq_ignore_ascii_case("content-length");
            let _ = write!(head, "{}: {}\r\n", name, value);
        }

        if !has_length && body_allowed(self.status) {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.extend_from_slice(b"\r\n");

        if self.body.is_empty() {
            vec![head]
        } else {
            vec![head, self.body.clone()]
        }
    }
}

fn body_allowed(status: Status) -> bool {
    !matches!(status, Status::SwitchingProtocols | Status::NoContent | Status::NotModified)
}
