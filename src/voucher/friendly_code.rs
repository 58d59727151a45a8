//! Short, manually typeable voucher codes.
//!
//! A friendly code is `xxxx-xxxx-xxxx`: the first 12 lowercase hex characters of
//! `SHA256(canonical_json(payload) || secret)`, regrouped in fours. Staff type it
//! when a QR image cannot be scanned.

use sha2::{Digest, Sha256};

use crate::voucher::config::SecretKey;
use crate::voucher::error::VoucherError;
use crate::voucher::payload::Payload;

const GROUP_LEN: usize = 4;
const GROUP_COUNT: usize = 3;
const CODE_HEX_LEN: usize = GROUP_LEN * GROUP_COUNT;

/// Derives friendly codes from payloads with the deployment secret.
#[derive(Debug, Clone)]
pub struct FriendlyCodeDeriver {
    secret: SecretKey,
}

impl FriendlyCodeDeriver {
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Derives the code for `payload`. Identical payloads give identical codes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voucher_redeem::{FriendlyCodeDeriver, Payload, SecretKey};
    ///
    /// let deriver = FriendlyCodeDeriver::new(SecretKey::from("secret"));
    /// let payload = Payload::new("points")
    ///     .with("memberId", "m1")
    ///     .with("redemptionId", "r1");
    ///
    /// let code = deriver.derive(&payload)?;
    /// assert_eq!(code.len(), 14);
    /// assert_eq!(code, deriver.derive(&payload)?);
    /// # Ok::<(), voucher_redeem::VoucherError>(())
    /// ```
    pub fn derive(&self, payload: &Payload) -> Result<String, VoucherError> {
        let mut hasher = Sha256::new();
        hasher.update(payload.to_canonical_json()?);
        hasher.update(self.secret.expose());
        let digest = hex::encode(hasher.finalize());

        Ok(format_groups(&digest[..CODE_HEX_LEN]))
    }

    /// Best-effort check that `code` belongs to `payload`.
    ///
    /// Case and dashes in `code` are ignored. Returns `false` when the payload
    /// cannot be serialized.
    pub fn matches(&self, code: &str, payload: &Payload) -> bool {
        match self.derive(payload) {
            Ok(expected) => normalize(code) == normalize(&expected),
            Err(_) => false,
        }
    }
}

/// Strips dashes and whitespace and lowercases, for code-to-code comparison.
pub fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Trims and uppercases a code typed at the counter, before the store lookup.
///
/// Stores compare the result case-insensitively against stored friendly codes
/// and, for legacy records, raw identifiers, so dashes are kept.
pub fn normalize_lookup(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Regroups a code typed without (or with misplaced) dashes into the stored
/// `XXXX-XXXX-XXXX` shape.
///
/// Returns `None` unless the code is exactly 12 hex characters once dashes and
/// whitespace are removed.
pub fn regroup_lookup(code: &str) -> Option<String> {
    let compact = normalize(code);
    (compact.len() == CODE_HEX_LEN && compact.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| format_groups(&compact).to_ascii_uppercase())
}

/// Whether `code` has the `xxxx-xxxx-xxxx` lowercase hex shape.
#[cfg(test)]
pub(crate) fn is_well_formed(code: &str) -> bool {
    let groups: Vec<&str> = code.split('-').collect();
    groups.len() == GROUP_COUNT
        && groups.iter().all(|g| {
            g.len() == GROUP_LEN && g.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
}

fn format_groups(hex: &str) -> String {
    let mut code = String::with_capacity(CODE_HEX_LEN + GROUP_COUNT - 1);
    for (i, c) in hex.chars().enumerate() {
        if i > 0 && i % GROUP_LEN == 0 {
            code.push('-');
        }
        code.push(c);
    }
    code
}
