// Tribune - Peer-to-peer asynchronous RPC runtime for contest management services
// Copyright (C) 2026  Tribune Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Frame terminator. Serialized JSON never contains a literal CRLF, so a
/// terminator match is always a frame boundary.
const TERMINATOR: &[u8] = b"\r\n";

/// Hard cap on the inbox growth of a single frame. A peer that streams more
/// than this without a terminator gets its connection closed.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Envelope of a method call.
///
/// The correlation id is omitted for fire-and-forget calls; the callee then
/// computes the method but its reply has nothing to match and is dropped.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Request {
    #[serde(rename = "__method")]
    pub method: String,

    /// Named arguments of the call, as one JSON object.
    #[serde(rename = "__data", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(rename = "__id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Envelope answering a request. `data` and `error` are mutually exclusive:
/// a set `error` means `data` carries null.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Response {
    /// Correlation id copied from the request, when the request had one.
    #[serde(rename = "__id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "__data", default)]
    pub data: Value,

    #[serde(rename = "__error", default)]
    pub error: Option<String>,
}

impl Response {
    pub fn empty(id: Option<String>) -> Self {
        Self {
            id,
            data: Value::Null,
            error: None,
        }
    }
}

/// A frame carries a request iff the `__method` key is present; everything
/// else is treated as a response envelope.
pub fn is_request(value: &Value) -> bool {
    value.get("__method").is_some()
}

/// Framing codec: one JSON envelope per line, terminated by CRLF.
///
/// Decoding yields the raw line payload, leaving JSON parsing to the caller
/// so that a malformed envelope can be dropped without tearing down the
/// connection. An unterminated fragment left at EOF is discarded as a
/// truncated frame.
pub struct EnvelopeCodec {
    /// Inbox offset already scanned for a terminator.
    scanned: usize,

    max_length: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            scanned: 0,
            max_length,
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        if let Some(offset) = src[self.scanned..]
            .windows(TERMINATOR.len())
            .position(|window| window == TERMINATOR)
        {
            let end = self.scanned + offset;
            self.scanned = 0;

            let mut frame = src.split_to(end + TERMINATOR.len());
            frame.truncate(end);

            return Ok(Some(frame));
        }

        if src.len() > self.max_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes without terminator", self.max_length),
            ));
        }

        // The last byte may pair with an upcoming \n; rescan it next time.
        self.scanned = src.len().saturating_sub(1);

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if !src.is_empty() {
            warn!("Discarding {} bytes of truncated trailing frame.", src.len());
            src.clear();
            self.scanned = 0;
        }

        Ok(None)
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + TERMINATOR.len());
        dst.extend_from_slice(&item);
        dst.extend_from_slice(TERMINATOR);

        Ok(())
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;
    #[allow(unused_imports)]
    use serde_json::json;

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let wire = b"{\"__method\":\"echo\",\"__data\":{\"string\":\"hi\"}}\r\n{\"__id\":\"abcd\",\"__data\":null,\"__error\":null}\r\n{\"partial";

        for chunk in 1..8 {
            let mut codec = EnvelopeCodec::new();
            let mut inbox = BytesMut::new();
            let mut frames = Vec::new();

            for piece in wire.chunks(chunk) {
                inbox.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut inbox).unwrap() {
                    frames.push(frame);
                }
            }

            assert_eq!(frames.len(), 2, "chunk size {}", chunk);
            assert_eq!(
                &frames[0][..],
                &b"{\"__method\":\"echo\",\"__data\":{\"string\":\"hi\"}}"[..]
            );

            // The unterminated tail is never yielded, and EOF discards it.
            assert_eq!(codec.decode_eof(&mut inbox).unwrap(), None);
            assert!(inbox.is_empty());
        }
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut codec = EnvelopeCodec::new();
        let mut inbox = BytesMut::new();

        inbox.extend_from_slice(b"{}\r");
        assert_eq!(codec.decode(&mut inbox).unwrap(), None);

        inbox.extend_from_slice(b"\n");
        let frame = codec.decode(&mut inbox).unwrap().unwrap();
        assert_eq!(&frame[..], b"{}");
    }

    #[test]
    fn oversize_frame_is_an_error() {
        let mut codec = EnvelopeCodec::with_max_length(16);
        let mut inbox = BytesMut::new();

        inbox.extend_from_slice(&[b'x'; 32]);
        assert!(codec.decode(&mut inbox).is_err());
    }

    #[test]
    fn request_id_is_omitted_when_absent() {
        let request = Request {
            method: "echo".to_string(),
            data: Some(json!({ "string": "hello" })),
            id: None,
        };

        let wire = serde_json::to_string(&request).unwrap();
        assert!(!wire.contains("__id"));
        assert!(wire.contains("\"__method\":\"echo\""));
    }

    #[test]
    fn response_always_carries_data_and_error() {
        let wire = serde_json::to_string(&Response::empty(Some("abc".to_string()))).unwrap();

        assert!(wire.contains("\"__data\":null"));
        assert!(wire.contains("\"__error\":null"));
    }

    #[test]
    fn unknown_envelope_fields_are_ignored() {
        let response: Response =
            serde_json::from_str("{\"__id\":\"x\",\"__data\":1,\"__error\":null,\"__extra\":true}")
                .unwrap();

        assert_eq!(response.id.as_deref(), Some("x"));
        assert_eq!(response.data, json!(1));
    }

    #[test]
    fn envelope_kind_is_sniffed_from_method_key() {
        let request: Value = serde_json::from_str("{\"__method\":\"echo\",\"__data\":{}}").unwrap();
        let response: Value = serde_json::from_str("{\"__id\":\"x\",\"__data\":null}").unwrap();

        assert!(is_request(&request));
        assert!(!is_request(&response));
    }
}
