//! Base64 payload codec

use crate::error::MessagingError;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Encode an adapter payload for the wire
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a wire payload back into adapter bytes.
///
/// Surrounding ASCII whitespace (e.g. a trailing newline from a CLI
/// publisher) is ignored.
pub fn decode_payload(text: &[u8]) -> Result<Vec<u8>, MessagingError> {
    let text = std::str::from_utf8(text).map_err(|e| MessagingError::Decode(e.to_string()))?;
    STANDARD
        .decode(text.trim())
        .map_err(|e| MessagingError::Decode(e.to_string()))
}
