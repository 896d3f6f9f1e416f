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

//! Opening-handshake helpers
//! [RFC 6455 Section 4](https://www.rfc-editor.org/rfc/rfc6455#section-4)

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http::{Request, Response, Status};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Builds the `101 Switching Protocols` response accepting an upgrade
/// request, or `None` when the request carries no `Sec-WebSocket-Key`.
pub fn upgrade_response(request: &Request) -> Option<Response> {
    let key = request.header("Sec-WebSocket-Key")?;
    Some(
        Response::new(Status::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", &accept_key(key)),
    )
}
