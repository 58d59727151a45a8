//! # Voucher Redeem
//!
//! Issuance, integrity verification and exactly-once redemption of member
//! vouchers.
//!
//! A voucher (free-entry ticket, point reward, event registration, tourism
//! booking or promotional benefit) is described by a small ordered payload.
//! At issuance the payload is encoded into a URL-safe token, bound to the
//! deployment with an HMAC-SHA256 tag, and condensed into a short friendly code
//! staff can type when a QR image cannot be scanned. At the point of service the
//! voucher is redeemed once by either channel.
//!
//! ## Features
//!
//! - **Tamper-evident tokens**: HMAC-SHA256 tags checked in constant time before
//!   a token is ever decoded
//! - **Friendly codes**: deterministic `xxxx-xxxx-xxxx` codes, case- and
//!   dash-insensitive
//! - **Exactly-once redemption**: a single conditional update per voucher, safe
//!   under concurrent requests
//! - **Best-effort audit**: history rows and proof documents that never undo a
//!   committed redemption
//! - **Pluggable storage**: in-memory by default, SQLite with `sqlite-storage`
//! - **Metrics**: optional issuance and redemption counters with `metrics`
//!
//! ## Quick Start
//!
//! ```rust
//! use voucher_redeem::{
//!     RedemptionDispatcher, StaffMember, Voucher, VoucherConfig, VoucherDetails, VoucherError,
//! };
//!
//! # async fn example() -> Result<(), VoucherError> {
//! let dispatcher = RedemptionDispatcher::builder(VoucherConfig::new("deployment-secret"))
//!     .build_and_init()
//!     .await?;
//!
//! // Issue: stores tag and friendly code, returns the QR URL
//! let issued = dispatcher
//!     .issuer()
//!     .issue(Voucher::new("t1", "m1", VoucherDetails::Ticket {
//!         ticket_name: "Museum Entry".to_string(),
//!         valid_date: None,
//!     }))
//!     .await?;
//! println!("QR: {}", issued.qr_url);
//! println!("Code: {}", issued.credentials.friendly_code);
//!
//! // Redeem once, by scanned token or typed code
//! let staff = StaffMember::new("a1", "Front Desk");
//! let result = dispatcher
//!     .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff)
//!     .await?;
//! println!("Proof: {:?}", result.proof_url);
//!
//! match dispatcher.redeem_by_code(&issued.credentials.friendly_code, &staff).await {
//!     Err(VoucherError::AlreadyRedeemed) => println!("Already used"),
//!     other => println!("Unexpected: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`VoucherConfig::from_env`] reads:
//!
//! ```bash
//! export VOUCHER_SECRET="a long random deployment secret"
//! export VOUCHER_VERIFY_ENDPOINT="https://example.org/api/vouchers/verify"
//! export VOUCHER_ENFORCE_EXPIRY=false
//! ```
//!
//! ## Architecture
//!
//! - **[`VoucherSigner`]**: token encoding, integrity tags and friendly codes
//! - **[`VoucherIssuer`]**: signs and persists new vouchers
//! - **[`RedemptionDispatcher`]**: resolves, checks and consumes vouchers
//! - **[`VoucherStore`]**: persistence collaborator
//! - **[`RedemptionAudit`]**: history and proof collaborator
//! - **[`VoucherError`]**: every failure mode

pub mod voucher;

// Re-export commonly used types
pub use voucher::storage;
pub use voucher::{
    FriendlyCodeDeriver, IssuedCredentials, IssuedVoucher, Member, MemoryAuditLog, Payload,
    RedemptionAudit, RedemptionDispatcher, RedemptionResult, SecretKey, SignedToken, StaffMember,
    Voucher, VoucherConfig, VoucherDetails, VoucherError, VoucherIssuer, VoucherKind,
    VoucherSigner, VoucherStatus, VoucherStore,
};

#[cfg(feature = "metrics")]
pub use voucher::metrics;
