//! Wire frames and delimiter framing
//!
//! A frame is a JSON object followed by [`FRAME_DELIMITER`]. The stream has
//! no other structure, so the receiver buffers bytes until it sees a
//! delimiter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IpcError;
use crate::{FRAME_DELIMITER, MAX_FRAME_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Req,
    Res,
    Err,
}

/// Frame exchanged with the local service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub flow: Flow,
    #[serde(default)]
    pub domain: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    /// Per-request unique ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    /// Session the frame belongs to
    #[serde(default)]
    pub caw: String,
    /// Error body; older local service versions send it here instead of `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
}

impl Frame {
    pub fn request(domain: &str, action: &str, data: Value, aid: Option<String>, caw: &str) -> Self {
        Self {
            flow: Flow::Req,
            domain: domain.to_string(),
            action: action.to_string(),
            data,
            aid,
            caw: caw.to_string(),
            err: None,
        }
    }

    /// Response to this frame, keeping its correlation fields
    pub fn reply(&self, data: Value) -> Self {
        Self {
            flow: Flow::Res,
            data,
            err: None,
            ..self.clone()
        }
    }

    /// Error response to this frame, keeping its correlation fields
    pub fn reply_err(&self, data: Value) -> Self {
        Self {
            flow: Flow::Err,
            data,
            err: None,
            ..self.clone()
        }
    }

    /// Response or event payload.
    ///
    /// Some actions answer with JSON text instead of a JSON value; such
    /// strings are decoded. Error frames prefer the `err` field.
    pub fn payload(&self) -> Value {
        let raw = match (&self.flow, &self.err) {
            (Flow::Err, Some(err)) => err,
            _ => &self.data,
        };
        match raw {
            Value::String(s) if s.starts_with('{') || s.starts_with('[') => {
                serde_json::from_str(s).unwrap_or_else(|_| raw.clone())
            }
            _ => raw.clone(),
        }
    }

    /// Serialize and append the delimiter
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(FRAME_DELIMITER);
        Ok(bytes)
    }
}

/// Accumulates received bytes and splits out complete frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes of an incomplete trailing frame
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if any.
    ///
    /// A frame that fails to decode is consumed and returned as an error so
    /// the caller can log it and keep reading.
    pub fn next_frame(&mut self) -> Option<Result<Frame, IpcError>> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == FRAME_DELIMITER) else {
                if self.buf.len() > MAX_FRAME_BYTES {
                    let len = self.buf.len();
                    self.buf.clear();
                    return Some(Err(IpcError::Protocol(format!(
                        "Discarded {} bytes without a frame delimiter",
                        len
                    ))));
                }
                return None;
            };

            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            let body = &raw[..raw.len() - 1];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(
                serde_json::from_slice::<Frame>(body)
                    .map_err(|e| IpcError::Protocol(format!("Malformed frame: {}", e))),
            );
        }
    }

    /// Take every complete frame currently buffered
    pub fn drain(&mut self) -> Vec<Result<Frame, IpcError>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Frame {
        Frame::request("code", "repo:active-path", json!({ "fpath": "/a.rs" }), Some("aid1".to_string()), "s1")
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(
            value,
            json!({
                "flow": "req",
                "domain": "code",
                "action": "repo:active-path",
                "data": { "fpath": "/a.rs" },
                "aid": "aid1",
                "caw": "s1"
            })
        );
    }

    #[test]
    fn test_split_across_reads() {
        let bytes = request().encode().unwrap();
        let (head, tail) = bytes.split_at(10);

        let mut buffer = FrameBuffer::new();
        buffer.push(head);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.pending_len(), 10);

        buffer.push(tail);
        let frame = buffer.next_frame().unwrap().unwrap();
        assert_eq!(frame, request());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut bytes = request().encode().unwrap();
        bytes.extend(request().reply(json!(1)).encode().unwrap());
        bytes.extend_from_slice(b"{\"flow\":\"res\"");

        let mut buffer = FrameBuffer::new();
        buffer.push(&bytes);
        let frames = buffer.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap().flow, Flow::Res);
        assert!(buffer.pending_len() > 0);
    }

    #[test]
    fn test_malformed_frame_does_not_block_the_next() {
        let mut bytes = b"{not json\x0c".to_vec();
        bytes.extend(request().encode().unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.push(&bytes);
        let frames = buffer.drain();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(IpcError::Protocol(_))));
        assert!(frames[1].is_ok());
    }

    #[test]
    fn test_blank_segments_are_skipped() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"\x0c \x0c");
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_payload_decodes_json_text() {
        let frame = request().reply(json!("{\"tmpDir\":\"/tmp/caw\"}"));
        assert_eq!(frame.payload(), json!({ "tmpDir": "/tmp/caw" }));

        let frame = request().reply(json!("plain"));
        assert_eq!(frame.payload(), json!("plain"));
    }

    #[test]
    fn test_error_payload_prefers_err_field() {
        let mut frame = request().reply_err(Value::Null);
        frame.err = Some(json!({ "message": "no repo" }));
        assert_eq!(frame.payload(), json!({ "message": "no repo" }));
    }
}
