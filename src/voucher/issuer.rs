use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::voucher::config::VoucherConfig;
use crate::voucher::error::VoucherError;
use crate::voucher::record::Voucher;
use crate::voucher::signature::{IssuedCredentials, VoucherSigner};
use crate::voucher::storage::VoucherStore;

#[cfg(feature = "metrics")]
use crate::voucher::metrics::{MetricEvent, MetricsCollector, NoOpMetricsCollector};

/// A persisted voucher together with the artifacts handed to its member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedVoucher {
    /// The stored record, with `tag` and `friendly_code` filled in
    pub voucher: Voucher,
    pub credentials: IssuedCredentials,
    /// Scannable `verify?data=…&hash=…` URL to render as the QR image
    pub qr_url: String,
}

/// Signs new vouchers and persists them.
///
/// Every issuance site (ticket creation, point redemption, event registration,
/// tourism booking, benefit claim) goes through [`VoucherIssuer::issue`], so
/// the stored tag and friendly code always match the canonical payload of the
/// record.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use voucher_redeem::storage::MemoryVoucherStore;
/// use voucher_redeem::{Voucher, VoucherConfig, VoucherDetails, VoucherIssuer};
///
/// # async fn example() -> Result<(), voucher_redeem::VoucherError> {
/// let config = VoucherConfig::new("deployment-secret");
/// let issuer = VoucherIssuer::from_config(&config, Arc::new(MemoryVoucherStore::new()));
///
/// let issued = issuer
///     .issue(Voucher::new("t1", "m1", VoucherDetails::Ticket {
///         ticket_name: "Museum Entry".to_string(),
///         valid_date: None,
///     }))
///     .await?;
/// assert!(issued.qr_url.starts_with("/api/vouchers/verify?data="));
/// # Ok(())
/// # }
/// ```
pub struct VoucherIssuer<S: VoucherStore> {
    signer: VoucherSigner,
    store: Arc<S>,
    verify_endpoint: String,
    #[cfg(feature = "metrics")]
    metrics_collector: Arc<dyn MetricsCollector>,
}

impl<S: VoucherStore> VoucherIssuer<S> {
    pub fn from_config(config: &VoucherConfig, store: Arc<S>) -> Self {
        Self::new(
            VoucherSigner::new(config.secret.clone()),
            store,
            config.verify_endpoint.clone(),
        )
    }

    pub(crate) fn new(signer: VoucherSigner, store: Arc<S>, verify_endpoint: String) -> Self {
        Self {
            signer,
            store,
            verify_endpoint,
            #[cfg(feature = "metrics")]
            metrics_collector: Arc::new(NoOpMetricsCollector::new()),
        }
    }

    /// Reports issued vouchers to `collector`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics_collector = collector;
        self
    }

    pub fn signer(&self) -> &VoucherSigner {
        &self.signer
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn verify_endpoint(&self) -> &str {
        &self.verify_endpoint
    }

    /// Signs `voucher`, records its tag and friendly code, and inserts it.
    ///
    /// # Errors
    ///
    /// * `EncodingError` - If the payload cannot be serialized
    /// * `DatabaseError` - If the store rejects the insert, e.g. a duplicate id
    pub async fn issue(&self, mut voucher: Voucher) -> Result<IssuedVoucher, VoucherError> {
        let credentials = self.signer.sign_and_derive(&voucher.payload())?;
        voucher.tag = Some(credentials.tag.clone());
        voucher.friendly_code = Some(credentials.friendly_code.clone());

        self.store.insert(&voucher).await?;

        tracing::debug!(
            kind = %voucher.kind(),
            voucher_id = %voucher.id,
            "issued voucher"
        );

        #[cfg(feature = "metrics")]
        self.metrics_collector
            .record_event(MetricEvent::VoucherIssued {
                kind: voucher.kind(),
            })
            .await;

        let qr_url = credentials.qr_url(&self.verify_endpoint);
        Ok(IssuedVoucher {
            voucher,
            credentials,
            qr_url,
        })
    }
}
