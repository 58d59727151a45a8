use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::voucher::error::VoucherError;

/// Key of the voucher kind discriminator inside every payload.
pub const TYPE_FIELD: &str = "type";

/// The logical attribute map describing what a voucher entitles.
///
/// Attributes keep their insertion order, and that order is part of the
/// canonical serialization: two payloads built with the same calls in the same
/// order serialize to identical bytes. A payload carries no timestamps or
/// nonces, so signing it twice yields the same token and tag.
///
/// # Example
///
/// ```rust
/// use voucher_redeem::Payload;
///
/// let payload = Payload::new("ticket")
///     .with("memberId", "m1")
///     .with("ticketId", "t1");
///
/// assert_eq!(payload.voucher_type(), Some("ticket"));
/// assert_eq!(
///     String::from_utf8(payload.to_canonical_json()?).unwrap(),
///     r#"{"type":"ticket","memberId":"m1","ticketId":"t1"}"#
/// );
/// # Ok::<(), voucher_redeem::VoucherError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Starts a payload with the `type` discriminator.
    pub fn new(voucher_type: &str) -> Self {
        let mut attributes = Map::new();
        attributes.insert(TYPE_FIELD.to_string(), Value::from(voucher_type));
        Self(attributes)
    }

    /// Wraps an existing attribute map, keeping its order.
    pub fn from_attributes(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    /// Appends an attribute. Re-inserting a key replaces the value in place.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// The `type` discriminator, if present and a string.
    pub fn voucher_type(&self) -> Option<&str> {
        self.0.get(TYPE_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Reads an identifier attribute.
    ///
    /// Identifiers issued by older call-sites were numeric, so integers are
    /// accepted and rendered in decimal. Empty strings count as absent.
    pub fn get_id(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact JSON in attribute insertion order.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, VoucherError> {
        serde_json::to_vec(&self.0).map_err(|e| VoucherError::EncodingError(e.to_string()))
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(attributes: Map<String, Value>) -> Self {
        Self::from_attributes(attributes)
    }
}
