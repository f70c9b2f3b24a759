use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyEncoding {
    #[serde(rename = "utf8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// Persisted form of a request or response body.
///
/// Text that survives a UTF-8 round trip is stored as-is so fixtures stay
/// readable and diffable; anything else falls back to base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBody {
    #[serde(rename = "bodyEncoding")]
    pub body_encoding: BodyEncoding,
    pub body: String,
}

#[derive(Debug)]
pub struct BodyDecodeError {
    source: base64::DecodeError,
}

impl std::fmt::Display for BodyDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode base64 body: {}", self.source)
    }
}

impl std::error::Error for BodyDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub fn encode(bytes: &[u8]) -> EncodedBody {
    // A lossless decode re-encodes to exactly the same length; lossy decodes
    // grow because every invalid sequence becomes U+FFFD.
    match std::str::from_utf8(bytes) {
        Ok(text) if text.len() == bytes.len() => EncodedBody {
            body_encoding: BodyEncoding::Utf8,
            body: text.to_owned(),
        },
        _ => EncodedBody {
            body_encoding: BodyEncoding::Base64,
            body: STANDARD.encode(bytes),
        },
    }
}

pub fn decode(encoded: &EncodedBody) -> Result<Vec<u8>, BodyDecodeError> {
    match encoded.body_encoding {
        BodyEncoding::Utf8 => Ok(encoded.body.as_bytes().to_vec()),
        BodyEncoding::Base64 => STANDARD
            .decode(encoded.body.as_bytes())
            .map_err(|source| BodyDecodeError { source }),
    }
}
