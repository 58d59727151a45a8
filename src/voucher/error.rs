use std::fmt::Display;

use thiserror::Error;

/// Error types that can occur while issuing or redeeming vouchers.
///
/// Each variant corresponds to a specific failure mode of the issuance,
/// integrity-verification or redemption pipeline.
///
/// # Error Categories
///
/// - **Artifact Errors**: `DecodeError`, `InvalidSignature`: the client supplied a
///   token, tag or code that cannot be trusted. Never retried.
/// - **Rejections**: `NotFound`, `AlreadyRedeemed`, `NotRedeemable`: reported to the
///   staff member, no state change took place.
/// - **System Errors**: `DatabaseError`, `EncodingError`, `CryptoError`,
///   `ConfigError`, `ClockError`
///
/// # Example
///
/// ```rust
/// use voucher_redeem::{RedemptionDispatcher, StaffMember, VoucherConfig, VoucherError};
///
/// # async fn example() -> Result<(), VoucherError> {
/// let dispatcher = RedemptionDispatcher::builder(VoucherConfig::new("secret"))
///     .build_and_init()
///     .await?;
/// let staff = StaffMember::new("admin-1", "Front Desk");
///
/// match dispatcher.redeem_by_code("abcd-ef01-2345", &staff).await {
///     Ok(result) => println!("Redeemed {}", result.voucher_label),
///     Err(VoucherError::NotFound) => println!("Unknown code"),
///     Err(VoucherError::AlreadyRedeemed) => println!("Voucher was already used"),
///     Err(e) => println!("Other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum VoucherError {
    /// The token is not valid base64url or does not carry a JSON object.
    ///
    /// Only produced by the payload codec when called directly. The redemption
    /// path checks the tag before decoding, so a malformed token there surfaces
    /// as `InvalidSignature`.
    #[error("Malformed voucher token: {0}")]
    DecodeError(String),

    /// A payload could not be serialized into its canonical form.
    #[error("Payload encoding failed: {0}")]
    EncodingError(String),

    /// The integrity tag does not match the token.
    ///
    /// This error occurs when the tag presented with a QR token differs from the
    /// HMAC recomputed with the deployment secret.
    ///
    /// # When This Occurs
    ///
    /// - The token or tag has been edited (tampering)
    /// - The voucher was issued by a deployment with a different secret
    /// - The tag was truncated or re-cased in transit
    ///
    /// # Resolution
    ///
    /// None on the server side. The voucher holder must present the original QR code.
    #[error("Invalid signature")]
    InvalidSignature,

    /// No voucher matches the supplied token or code.
    ///
    /// Also returned when a correctly signed token names a voucher whose stored
    /// owner (or event) differs from the one embedded in the payload.
    #[error("Voucher not found")]
    NotFound,

    /// The voucher has already been redeemed.
    ///
    /// This is the idempotency boundary: the second of two redemptions for the
    /// same voucher observes this error, and no audit row is written for it.
    #[error("Voucher already redeemed")]
    AlreadyRedeemed,

    /// A kind-specific precondition failed, e.g. an unpaid tourism booking.
    #[error("Voucher not redeemable: {0}")]
    NotRedeemable(String),

    /// The voucher store or audit store failed.
    ///
    /// This is the only error eligible for a bounded retry, and only around the
    /// conditional redemption update.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A cryptographic primitive could not be initialized.
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// The configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The system clock could not be read.
    #[error("Clock error: {0}")]
    ClockError(String),
}

impl VoucherError {
    /// Wraps a backend error as a `DatabaseError`.
    pub fn from_database_error<E: Display>(error: E) -> Self {
        Self::DatabaseError(error.to_string())
    }

    /// Creates a `DatabaseError` from a plain message.
    pub fn from_database_message(message: impl Into<String>) -> Self {
        Self::DatabaseError(message.into())
    }

    /// Stable identifier used in log fields and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DecodeError(_) => "decode_error",
            Self::EncodingError(_) => "encoding_error",
            Self::InvalidSignature => "invalid_signature",
            Self::NotFound => "not_found",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::NotRedeemable(_) => "not_redeemable",
            Self::DatabaseError(_) => "storage_error",
            Self::CryptoError(_) => "crypto_error",
            Self::ConfigError(_) => "config_error",
            Self::ClockError(_) => "clock_error",
        }
    }

    /// Whether the error is caused by the presented artifact rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::DecodeError(_)
                | Self::InvalidSignature
                | Self::NotFound
                | Self::AlreadyRedeemed
                | Self::NotRedeemable(_)
        )
    }

    /// Whether the failed operation may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }
}
