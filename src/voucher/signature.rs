//! Integrity tags for voucher tokens.
//!
//! A voucher token is bound to the deployment with
//! `tag = hex(HMAC-SHA256(secret, token))`. Signing is deterministic: the same
//! payload always yields the same token and tag.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::voucher::codec;
use crate::voucher::config::SecretKey;
use crate::voucher::error::VoucherError;
use crate::voucher::friendly_code::FriendlyCodeDeriver;
use crate::voucher::payload::Payload;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-rendered HMAC-SHA256 tag.
const TAG_HEX_LEN: usize = 64;

/// An encoded payload and its integrity tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedToken {
    /// base64url encoding of the canonical payload JSON
    pub token: String,
    /// Lowercase hex HMAC-SHA256 of `token`
    pub tag: String,
}

/// Everything an issuance call-site stores on a new voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredentials {
    pub token: String,
    pub tag: String,
    pub friendly_code: String,
}

impl IssuedCredentials {
    /// Builds the scannable URL `endpoint?data=<token>&hash=<tag>`.
    ///
    /// Tokens and tags only contain URL-safe characters, so no escaping is needed.
    pub fn qr_url(&self, verify_endpoint: &str) -> String {
        let separator = if verify_endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{verify_endpoint}{separator}data={}&hash={}",
            self.token, self.tag
        )
    }
}

/// Signs payloads and verifies presented `(token, tag)` pairs.
///
/// # Example
///
/// ```rust
/// use voucher_redeem::{Payload, SecretKey, VoucherSigner, VoucherError};
///
/// let signer = VoucherSigner::new(SecretKey::from("secret"));
/// let payload = Payload::new("ticket")
///     .with("memberId", "m1")
///     .with("ticketId", "t1");
///
/// let signed = signer.sign(&payload)?;
/// assert_eq!(signer.verify(&signed.token, &signed.tag)?, payload);
///
/// let mut forged = signed.tag.clone();
/// forged.replace_range(0..1, if forged.starts_with('0') { "1" } else { "0" });
/// assert!(matches!(
///     signer.verify(&signed.token, &forged),
///     Err(VoucherError::InvalidSignature)
/// ));
/// # Ok::<(), VoucherError>(())
/// ```
#[derive(Debug, Clone)]
pub struct VoucherSigner {
    secret: SecretKey,
    friendly_codes: FriendlyCodeDeriver,
}

impl VoucherSigner {
    pub fn new(secret: SecretKey) -> Self {
        Self {
            friendly_codes: FriendlyCodeDeriver::new(secret.clone()),
            secret,
        }
    }

    /// The friendly code deriver sharing this signer's secret.
    pub fn friendly_codes(&self) -> &FriendlyCodeDeriver {
        &self.friendly_codes
    }

    /// Encodes and tags a payload.
    pub fn sign(&self, payload: &Payload) -> Result<SignedToken, VoucherError> {
        let token = codec::encode(payload)?;
        let tag = self.compute_tag(&token)?;
        Ok(SignedToken { token, tag })
    }

    /// Checks `tag` against `token` and returns the decoded payload.
    ///
    /// The comparison runs in constant time. The token is decoded only after the
    /// tag has matched; any failure, including a token that decodes badly under
    /// a valid tag, is reported as `InvalidSignature`.
    pub fn verify(&self, token: &str, tag: &str) -> Result<Payload, VoucherError> {
        // Only the canonical lowercase rendering is accepted, so every textual
        // change to the tag is a mismatch.
        if !is_canonical_tag(tag) {
            tracing::debug!("rejected voucher tag with non-canonical encoding");
            return Err(VoucherError::InvalidSignature);
        }
        let presented = hex::decode(tag).map_err(|_| VoucherError::InvalidSignature)?;

        let mut mac = self.create_hmac()?;
        mac.update(token.as_bytes());
        mac.verify_slice(&presented).map_err(|_| {
            tracing::debug!("voucher tag mismatch");
            VoucherError::InvalidSignature
        })?;

        codec::decode(token).map_err(|e| {
            tracing::warn!(error = %e, "correctly tagged voucher token failed to decode");
            VoucherError::InvalidSignature
        })
    }

    /// Signs the payload and derives its friendly code.
    ///
    /// This is the single call every issuance site makes.
    pub fn sign_and_derive(&self, payload: &Payload) -> Result<IssuedCredentials, VoucherError> {
        let SignedToken { token, tag } = self.sign(payload)?;
        let friendly_code = self.friendly_codes.derive(payload)?;
        Ok(IssuedCredentials {
            token,
            tag,
            friendly_code,
        })
    }

    fn compute_tag(&self, token: &str) -> Result<String, VoucherError> {
        let mut mac = self.create_hmac()?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn create_hmac(&self) -> Result<HmacSha256, VoucherError> {
        HmacSha256::new_from_slice(self.secret.expose())
            .map_err(|e| VoucherError::CryptoError(format!("Invalid HMAC key: {e}")))
    }
}

fn is_canonical_tag(tag: &str) -> bool {
    tag.len() == TAG_HEX_LEN && tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
