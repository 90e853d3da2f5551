//! Frame encoding and decoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::MAX_FRAME_BYTES;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Header
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON header of a tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameHeader {
    /// Server → agent: an HTTP request to execute locally. The frame
    /// payload is the request body.
    Request {
        /// Opaque request id; responses echo it back.
        id: String,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
    },

    /// Agent → server: one chunk of the response for `id`. The frame
    /// payload is the body chunk (possibly empty).
    Stream {
        id: String,
        /// HTTP status; present on the first frame of a response only.
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        /// Response headers; present on the first frame only.
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        /// Set on the final frame of the response.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        done: bool,
    },
}

impl FrameHeader {
    /// The request id this header belongs to.
    pub fn id(&self) -> &str {
        match self {
            FrameHeader::Request { id, .. } => id,
            FrameHeader::Stream { id, .. } => id,
        }
    }
}

/// A complete tunnel frame: header plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Frame {
            header: FrameHeader::Request {
                id: id.into(),
                method: method.into(),
                path: path.into(),
                headers,
            },
            payload: body,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("header JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame into one binary WebSocket message.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let header = serde_json::to_vec(&frame.header)?;
    let total = 4 + header.len() + frame.payload.len();
    if total > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(total));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Decode one binary WebSocket message into a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    if bytes.len() < 4 {
        return Err(ProtocolError::Truncated { need: 4, have: bytes.len() });
    }
    let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let need = 4 + header_len;
    if bytes.len() < need {
        return Err(ProtocolError::Truncated { need, have: bytes.len() });
    }
    let header: FrameHeader = serde_json::from_slice(&bytes[4..need])?;
    Ok(Frame { header, payload: bytes[need..].to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn roundtrip(frame: Frame) {
        let bytes = encode(&frame).expect("encode");
        let back = decode(&bytes).expect("decode");
        assert_eq!(back, frame);
    }

    #[test]
    fn request_roundtrip_across_payload_sizes() {
        // 0 bytes up through 2^20, including the chunk target and hard cap.
        for size in [0usize, 1, 7, 1024, 16 * 1024, 32 * 1024, 1 << 20] {
            roundtrip(Frame::request(
                "req-1",
                "POST",
                "/echo?x=1",
                headers(&[("content-type", "application/json"), ("accept", "*/*")]),
                vec![0xA5; size],
            ));
        }
    }

    #[test]
    fn stream_roundtrip_first_middle_last() {
        // First frame: status + headers.
        roundtrip(Frame {
            header: FrameHeader::Stream {
                id: "req-1".into(),
                status: Some(200),
                headers: Some(headers(&[("content-type", "text/event-stream")])),
                done: false,
            },
            payload: b"data: hello\n\n".to_vec(),
        });
        // Middle frame: chunk only.
        roundtrip(Frame {
            header: FrameHeader::Stream {
                id: "req-1".into(),
                status: None,
                headers: None,
                done: false,
            },
            payload: vec![1, 2, 3],
        });
        // Final frame: done, possibly empty payload.
        roundtrip(Frame {
            header: FrameHeader::Stream {
                id: "req-1".into(),
                status: None,
                headers: None,
                done: true,
            },
            payload: Vec::new(),
        });
    }

    #[test]
    fn wire_layout_is_length_prefixed_json() {
        let frame = Frame::request("r", "GET", "/", BTreeMap::new(), b"body".to_vec());
        let bytes = encode(&frame).unwrap();
        let header_len =
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&bytes[4..4 + header_len]).unwrap();
        assert_eq!(header["type"], "request");
        assert_eq!(header["method"], "GET");
        assert_eq!(&bytes[4 + header_len..], b"body");
    }

    #[test]
    fn middle_frames_omit_optional_fields_on_the_wire() {
        let frame = Frame {
            header: FrameHeader::Stream {
                id: "r".into(),
                status: None,
                headers: None,
                done: false,
            },
            payload: Vec::new(),
        };
        let bytes = encode(&frame).unwrap();
        let header_len =
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&bytes[4..4 + header_len]).unwrap();
        let obj = header.as_object().unwrap();
        assert!(!obj.contains_key("status"));
        assert!(!obj.contains_key("headers"));
        assert!(!obj.contains_key("done"));
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        let frame = Frame::request("r", "GET", "/", BTreeMap::new(), b"body".to_vec());
        let bytes = encode(&frame).unwrap();
        assert!(matches!(
            decode(&bytes[..2]),
            Err(ProtocolError::Truncated { .. })
        ));
        // Length prefix intact but header cut short.
        assert!(matches!(
            decode(&bytes[..6]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn garbage_header_is_a_json_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(b"nope!");
        assert!(matches!(decode(&bytes), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn oversized_frame_is_rejected_by_encode() {
        let frame = Frame::request(
            "r",
            "POST",
            "/",
            BTreeMap::new(),
            vec![0; crate::MAX_FRAME_BYTES],
        );
        assert!(matches!(
            encode(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn unknown_header_type_is_rejected() {
        // "abort" is reserved but unimplemented; decoding must fail loudly.
        let header = br#"{"type":"abort","id":"r"}"#;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(header.len() as u32).to_be_bytes());
        bytes.extend_from_slice(header);
        assert!(matches!(decode(&bytes), Err(ProtocolError::Json(_))));
    }
}
