//! Wire envelope encoding and frame payload decoding.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Envelope serialization format, selected per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnvelopeFormat {
    /// JSON documents sent as text frames.
    #[default]
    Json,
    /// MessagePack maps sent as binary frames.
    MsgPack,
}

impl EnvelopeFormat {
    /// Parse a query selector. Unknown values default to JSON.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "msgpack" => EnvelopeFormat::MsgPack,
            _ => EnvelopeFormat::Json,
        }
    }
}

/// Decoded frame payload as it appears in the envelope.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FramePayload {
    /// Little-endian IEEE-754 doubles reinterpreted from the raw bytes.
    ///
    /// Non-finite values survive msgpack encoding as-is; serde_json renders
    /// them as `null` members, keeping the JSON document well formed.
    Doubles(Vec<f64>),
    /// Payload bytes that decoded as a UTF-8 JSON document.
    Json(Value),
}

impl FramePayload {
    /// Whether this payload is the end-of-stream sentinel.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, FramePayload::Json(Value::Null))
    }
}

/// Decode raw payload bytes per the envelope rules.
///
/// A byte length that is a multiple of 8 reinterprets as f64s; otherwise a
/// UTF-8 JSON decode is attempted; anything else degrades to an empty vector.
pub fn decode_payload(bytes: &[u8]) -> FramePayload {
    if bytes.is_empty() {
        return FramePayload::Doubles(Vec::new());
    }
    if bytes.len() % 8 == 0 {
        let doubles = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        return FramePayload::Doubles(doubles);
    }
    let decoded = std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(text).ok());
    match decoded {
        Some(value) => FramePayload::Json(value),
        None => {
            debug!(
                len = bytes.len(),
                "payload is neither f64-aligned nor JSON; delivering empty"
            );
            FramePayload::Doubles(Vec::new())
        }
    }
}

/// Decode stored metadata bytes as UTF-8, substituting `"{}"` when
/// undecodable.
pub fn decode_metadata(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            warn!("frame metadata is not valid UTF-8; substituting empty object");
            "{}".to_string()
        }
    }
}

/// An encoded envelope ready for the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The on-the-wire object delivered per frame.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub sequence: u64,
    pub metadata: String,
    pub payload: FramePayload,
    pub server_host: String,
}

impl Envelope {
    /// Encode in the requested format.
    ///
    /// An envelope exceeding `max_frame_size` is replaced by a substitute
    /// error envelope in the same format; the stream continues.
    pub fn encode(&self, format: EnvelopeFormat, max_frame_size: usize) -> WireFrame {
        let frame = encode_value(self, format);
        if frame.len() > max_frame_size {
            warn!(
                sequence = self.sequence,
                size = frame.len(),
                limit = max_frame_size,
                "envelope exceeds frame cap; sending substitute"
            );
            return encode_value(&ErrorEnvelope { error: "Frame too large" }, format);
        }
        frame
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
}

fn encode_value<T: Serialize>(value: &T, format: EnvelopeFormat) -> WireFrame {
    match format {
        EnvelopeFormat::Json => {
            WireFrame::Text(serde_json::to_string(value).unwrap_or_default())
        }
        EnvelopeFormat::MsgPack => {
            WireFrame::Binary(rmp_serde::to_vec_named(value).unwrap_or_default())
        }
    }
}
