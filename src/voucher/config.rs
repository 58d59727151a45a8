use std::fmt;
use std::sync::Arc;

use crate::voucher::error::VoucherError;

/// Default path of the QR verification endpoint embedded in issued QR codes.
pub const DEFAULT_VERIFY_ENDPOINT: &str = "/api/vouchers/verify";

const SECRET_ENV: &str = "VOUCHER_SECRET";
const VERIFY_ENDPOINT_ENV: &str = "VOUCHER_VERIFY_ENDPOINT";
const ENFORCE_EXPIRY_ENV: &str = "VOUCHER_ENFORCE_EXPIRY";

/// The deployment-wide signing secret.
///
/// Loaded once at startup and shared by the signer and the friendly code
/// deriver. Cloning is cheap. The `Debug` output never contains the key bytes.
#[derive(Clone)]
pub struct SecretKey(Arc<[u8]>);

impl SecretKey {
    /// Wraps raw key material.
    pub fn new(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([redacted; {} bytes])", self.0.len())
    }
}

impl From<&[u8]> for SecretKey {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for SecretKey {
    fn from(secret: &str) -> Self {
        Self::new(secret.as_bytes())
    }
}

impl From<String> for SecretKey {
    fn from(secret: String) -> Self {
        Self::new(secret.as_bytes())
    }
}

impl From<Vec<u8>> for SecretKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

/// Configuration for voucher issuance and redemption.
///
/// # Environment Variables
///
/// [`VoucherConfig::from_env`] reads:
/// - `VOUCHER_SECRET`: the signing secret (required)
/// - `VOUCHER_VERIFY_ENDPOINT`: QR verification endpoint (default: `/api/vouchers/verify`)
/// - `VOUCHER_ENFORCE_EXPIRY`: reject expired vouchers at redemption (default: `false`)
///
/// # Example
///
/// ```rust
/// use voucher_redeem::VoucherConfig;
///
/// let config = VoucherConfig::new("deployment-secret")
///     .with_verify_endpoint("https://example.org/verify")
///     .with_enforce_expiry(true);
/// assert!(config.summary().contains("https://example.org/verify"));
/// ```
#[derive(Debug, Clone)]
pub struct VoucherConfig {
    /// Secret used for integrity tags and friendly codes
    pub secret: SecretKey,
    /// Endpoint placed in front of `?data=<token>&hash=<tag>` in QR URLs
    pub verify_endpoint: String,
    /// Whether a past `valid_date`/promo end blocks redemption
    pub enforce_expiry: bool,
}

impl VoucherConfig {
    /// Creates a configuration with default endpoint and expiry policy.
    pub fn new(secret: impl Into<SecretKey>) -> Self {
        Self {
            secret: secret.into(),
            verify_endpoint: DEFAULT_VERIFY_ENDPOINT.to_string(),
            enforce_expiry: false,
        }
    }

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, VoucherError> {
        let secret = std::env::var(SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VoucherError::ConfigError(format!("{SECRET_ENV} is not set")))?;

        let verify_endpoint = std::env::var(VERIFY_ENDPOINT_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VERIFY_ENDPOINT.to_string());

        let enforce_expiry = std::env::var(ENFORCE_EXPIRY_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            secret: SecretKey::from(secret),
            verify_endpoint,
            enforce_expiry,
        })
    }

    pub fn with_verify_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.verify_endpoint = endpoint.into();
        self
    }

    pub fn with_enforce_expiry(mut self, enforce: bool) -> Self {
        self.enforce_expiry = enforce;
        self
    }

    /// Validates the configuration and returns any warnings.
    ///
    /// # Returns
    ///
    /// A vector of warning messages for potentially problematic settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.secret.is_empty() {
            warnings.push("Empty secret makes every integrity tag forgeable".to_string());
        } else if self.secret.len() < 32 {
            warnings.push("Secret shorter than 32 bytes weakens integrity tags".to_string());
        }

        if self.verify_endpoint.trim().is_empty() {
            warnings.push("Empty verify endpoint produces relative QR URLs".to_string());
        }
        if self.verify_endpoint.contains("data=") || self.verify_endpoint.contains("hash=") {
            warnings.push(
                "Verify endpoint already carries data/hash parameters; QR URLs will be ambiguous"
                    .to_string(),
            );
        }

        warnings
    }

    /// Returns a summary of the current configuration without the secret.
    pub fn summary(&self) -> String {
        format!(
            "VoucherConfig {{ Secret: {} bytes, Verify endpoint: {}, Enforce expiry: {} }}",
            self.secret.len(),
            self.verify_endpoint,
            self.enforce_expiry,
        )
    }
}
