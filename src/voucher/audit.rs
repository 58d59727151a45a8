//! Redemption history and proof documents.
//!
//! The audit collaborator is called after a voucher has been consumed. Its
//! failures never undo a redemption; the dispatcher logs them and reports the
//! redemption as successful.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::voucher::error::VoucherError;
use crate::voucher::record::VoucherKind;

/// Default base under which [`MemoryAuditLog`] mints proof URLs.
pub const DEFAULT_PROOF_BASE_URL: &str = "/proofs";

/// A history row to be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRedeemHistory {
    pub member_id: String,
    pub member_name: String,
    pub voucher_type: VoucherKind,
    pub voucher_id: String,
    pub voucher_label: String,
    pub redeemed_at: i64,
    pub admin_id: String,
    pub admin_name: String,
    pub proof_url: Option<String>,
}

/// An appended, immutable history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemHistory {
    pub id: String,
    pub member_id: String,
    pub member_name: String,
    pub voucher_type: VoucherKind,
    pub voucher_id: String,
    pub voucher_label: String,
    pub redeemed_at: i64,
    pub admin_id: String,
    pub admin_name: String,
    pub proof_url: Option<String>,
}

/// Inputs of a human-readable proof document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub kind_label: String,
    pub member_name: String,
    pub voucher_label: String,
    pub redeemed_at: i64,
    pub admin_name: String,
    /// Scannable `verify?data=…&hash=…` URL to print as the QR image
    pub qr_url: Option<String>,
}

/// Records redemption history and produces proof documents.
#[async_trait]
pub trait RedemptionAudit: Send + Sync {
    /// Appends a history row and returns its id.
    async fn record_history(&self, entry: NewRedeemHistory) -> Result<String, VoucherError>;

    /// Renders and stores a proof document, returning where it can be fetched.
    async fn generate_proof(&self, request: &ProofRequest) -> Result<String, VoucherError>;
}

/// In-memory audit log for tests and single-instance deployments.
///
/// History ids are random UUIDs; proof URLs are `<base>/<uuid>.pdf` and the
/// rendered proof text is kept alongside.
#[derive(Debug)]
pub struct MemoryAuditLog {
    proof_base_url: String,
    histories: RwLock<Vec<RedeemHistory>>,
    proofs: RwLock<Vec<(String, String)>>,
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::with_proof_base_url(DEFAULT_PROOF_BASE_URL)
    }

    pub fn with_proof_base_url(base: impl Into<String>) -> Self {
        Self {
            proof_base_url: base.into().trim_end_matches('/').to_string(),
            histories: RwLock::new(Vec::new()),
            proofs: RwLock::new(Vec::new()),
        }
    }

    /// All history rows in insertion order.
    pub async fn histories(&self) -> Vec<RedeemHistory> {
        self.histories.read().await.clone()
    }

    /// History rows of one voucher.
    pub async fn history_for(&self, kind: VoucherKind, voucher_id: &str) -> Vec<RedeemHistory> {
        self.histories
            .read()
            .await
            .iter()
            .filter(|h| h.voucher_type == kind && h.voucher_id == voucher_id)
            .cloned()
            .collect()
    }

    /// The rendered proof document stored under `proof_url`.
    pub async fn proof(&self, proof_url: &str) -> Option<String> {
        self.proofs
            .read()
            .await
            .iter()
            .find(|(url, _)| url == proof_url)
            .map(|(_, document)| document.clone())
    }
}

#[async_trait]
impl RedemptionAudit for MemoryAuditLog {
    async fn record_history(&self, entry: NewRedeemHistory) -> Result<String, VoucherError> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = RedeemHistory {
            id: id.clone(),
            member_id: entry.member_id,
            member_name: entry.member_name,
            voucher_type: entry.voucher_type,
            voucher_id: entry.voucher_id,
            voucher_label: entry.voucher_label,
            redeemed_at: entry.redeemed_at,
            admin_id: entry.admin_id,
            admin_name: entry.admin_name,
            proof_url: entry.proof_url,
        };
        self.histories.write().await.push(row);
        Ok(id)
    }

    async fn generate_proof(&self, request: &ProofRequest) -> Result<String, VoucherError> {
        let url = format!("{}/{}.pdf", self.proof_base_url, uuid::Uuid::new_v4());
        self.proofs
            .write()
            .await
            .push((url.clone(), render_proof(request)));
        Ok(url)
    }
}

/// Plain-text body of a proof document.
pub fn render_proof(request: &ProofRequest) -> String {
    let mut document = format!(
        "REDEMPTION PROOF\n\
         Type: {}\n\
         Member: {}\n\
         Voucher: {}\n\
         Redeemed at (unix): {}\n\
         Redeemed by: {}\n",
        request.kind_label,
        request.member_name,
        request.voucher_label,
        request.redeemed_at,
        request.admin_name,
    );
    if let Some(qr_url) = &request.qr_url {
        document.push_str(&format!("QR: {qr_url}\n"));
    }
    document
}
