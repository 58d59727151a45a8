//! Payload codec.
//!
//! Turns a [`Payload`] into a compact, URL-safe token and back. The token is
//! the base64url encoding (no padding) of the payload's canonical JSON.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde_json::Value;

use crate::voucher::error::VoucherError;
use crate::voucher::payload::Payload;

/// base64url without padding on output; padded input is tolerated.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encodes a payload into a token.
pub fn encode(payload: &Payload) -> Result<String, VoucherError> {
    let json = payload.to_canonical_json()?;
    Ok(TOKEN_ENGINE.encode(json))
}

/// Decodes a token back into a payload.
///
/// Fails with `DecodeError` when the token is not base64url, not UTF-8 JSON,
/// or the JSON is not an object.
pub fn decode(token: &str) -> Result<Payload, VoucherError> {
    let bytes = TOKEN_ENGINE
        .decode(token.trim())
        .map_err(|e| VoucherError::DecodeError(format!("invalid base64url: {e}")))?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(attributes)) => Ok(Payload::from(attributes)),
        Ok(_) => Err(VoucherError::DecodeError(
            "payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(VoucherError::DecodeError(format!("invalid JSON: {e}"))),
    }
}
