use std::fmt;
use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::time::Instant;

use crate::voucher::audit::{MemoryAuditLog, NewRedeemHistory, ProofRequest, RedemptionAudit};
use crate::voucher::config::VoucherConfig;
use crate::voucher::dispatcher_builder::RedemptionDispatcherBuilder;
use crate::voucher::error::VoucherError;
use crate::voucher::friendly_code::{normalize_lookup, regroup_lookup};
use crate::voucher::issuer::VoucherIssuer;
use crate::voucher::payload::Payload;
use crate::voucher::record::{RedemptionResult, StaffMember, Voucher, VoucherKind};
use crate::voucher::signature::VoucherSigner;
use crate::voucher::storage::{MemoryVoucherStore, VoucherStore};
use crate::voucher::time_utils;

#[cfg(feature = "metrics")]
use crate::voucher::metrics::{AuditStage, MetricEvent, MetricsCollector, NoOpMetricsCollector};

/// A failed conditional transition is retried at most this many times.
const MAX_TRANSITION_RETRIES: u32 = 1;

/// How a redemption request identified its voucher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionChannel {
    /// Scanned QR token and tag
    Token,
    /// Typed friendly code or legacy id
    Code,
}

impl RedemptionChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Code => "code",
        }
    }
}

impl fmt::Display for RedemptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Redeems vouchers presented by QR token or by typed code.
///
/// Each voucher is consumed at most once. The state change is a single
/// conditional update in the store; when several requests race for the same
/// voucher, one succeeds and the rest fail with `AlreadyRedeemed`. History and
/// proof are written after the change is committed and never undo it.
///
/// To create an instance, use [`RedemptionDispatcher::builder`].
///
/// # Example
///
/// ```rust
/// use voucher_redeem::{
///     RedemptionDispatcher, StaffMember, Voucher, VoucherConfig, VoucherDetails, VoucherError,
/// };
///
/// # async fn example() -> Result<(), VoucherError> {
/// let dispatcher = RedemptionDispatcher::builder(VoucherConfig::new("deployment-secret"))
///     .build_and_init()
///     .await?;
///
/// let issued = dispatcher
///     .issuer()
///     .issue(Voucher::new("t1", "m1", VoucherDetails::Ticket {
///         ticket_name: "Museum Entry".to_string(),
///         valid_date: None,
///     }))
///     .await?;
///
/// let staff = StaffMember::new("a1", "Front Desk");
/// let result = dispatcher
///     .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff)
///     .await?;
/// assert_eq!(result.voucher_id, "t1");
///
/// let again = dispatcher.redeem_by_code(&issued.credentials.friendly_code, &staff).await;
/// assert!(matches!(again, Err(VoucherError::AlreadyRedeemed)));
/// # Ok(())
/// # }
/// ```
pub struct RedemptionDispatcher<S: VoucherStore, A: RedemptionAudit> {
    pub(crate) issuer: VoucherIssuer<S>,
    pub(crate) audit: Arc<A>,
    pub(crate) enforce_expiry: bool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics_collector: Arc<dyn MetricsCollector>,
}

impl RedemptionDispatcher<MemoryVoucherStore, MemoryAuditLog> {
    /// Creates a builder for a dispatcher using `config`.
    ///
    /// The builder defaults to `MemoryVoucherStore` and `MemoryAuditLog`.
    pub fn builder(config: VoucherConfig) -> RedemptionDispatcherBuilder<MemoryVoucherStore, MemoryAuditLog> {
        RedemptionDispatcherBuilder::new(config)
    }
}

impl<S: VoucherStore, A: RedemptionAudit> RedemptionDispatcher<S, A> {
    /// Internal constructor used by the builder.
    #[cfg(feature = "metrics")]
    pub(crate) fn new(
        config: &VoucherConfig,
        store: Arc<S>,
        audit: Arc<A>,
        metrics_collector: Option<Arc<dyn MetricsCollector>>,
    ) -> Self {
        let metrics_collector =
            metrics_collector.unwrap_or_else(|| Arc::new(NoOpMetricsCollector::new()));
        let issuer = VoucherIssuer::from_config(config, store)
            .with_metrics_collector(Arc::clone(&metrics_collector));
        Self {
            issuer,
            audit,
            enforce_expiry: config.enforce_expiry,
            metrics_collector,
        }
    }

    /// Internal constructor used by the builder (non-metrics version).
    #[cfg(not(feature = "metrics"))]
    pub(crate) fn new(config: &VoucherConfig, store: Arc<S>, audit: Arc<A>) -> Self {
        Self {
            issuer: VoucherIssuer::from_config(config, store),
            audit,
            enforce_expiry: config.enforce_expiry,
        }
    }

    pub(crate) async fn init(&self) -> Result<(), VoucherError> {
        self.store().init().await
    }

    /// The issuer sharing this dispatcher's secret and store.
    pub fn issuer(&self) -> &VoucherIssuer<S> {
        &self.issuer
    }

    pub fn signer(&self) -> &VoucherSigner {
        self.issuer.signer()
    }

    pub fn store(&self) -> &Arc<S> {
        self.issuer.store()
    }

    pub fn audit(&self) -> &Arc<A> {
        &self.audit
    }

    /// Returns the metrics collector.
    #[cfg(feature = "metrics")]
    pub fn metrics_collector(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics_collector
    }

    /// Redeems the voucher behind a scanned `(token, tag)` pair.
    ///
    /// Only ticket, point and event vouchers are reachable this way. The payload
    /// must name an existing voucher whose owner (and event, for registrations)
    /// agrees with the stored record.
    ///
    /// # Errors
    ///
    /// * `InvalidSignature` - The tag does not match the token
    /// * `NotFound` - Unsupported type, unknown voucher, or cross-check mismatch
    /// * `AlreadyRedeemed` - The voucher was consumed earlier or by a concurrent request
    /// * `NotRedeemable` - The voucher's status does not allow redemption
    /// * `DatabaseError` - The store failed twice in a row
    pub async fn redeem_by_token(
        &self,
        token: &str,
        tag: &str,
        staff: &StaffMember,
    ) -> Result<RedemptionResult, VoucherError> {
        #[cfg(feature = "metrics")]
        let start = Instant::now();

        let result = self.redeem_token_inner(token, tag, staff).await;

        #[cfg(feature = "metrics")]
        self.record_attempt(RedemptionChannel::Token, &result, start).await;

        result
    }

    /// Redeems the voucher whose stored friendly code (or legacy id) is `code`.
    ///
    /// Kinds are probed in [`VoucherKind::REDEMPTION_ORDER`] and the first match
    /// wins. Case and surrounding whitespace are ignored, and a friendly code
    /// typed without dashes is still found.
    ///
    /// # Errors
    ///
    /// Same as [`redeem_by_token`](Self::redeem_by_token), minus `InvalidSignature`.
    pub async fn redeem_by_code(
        &self,
        code: &str,
        staff: &StaffMember,
    ) -> Result<RedemptionResult, VoucherError> {
        #[cfg(feature = "metrics")]
        let start = Instant::now();

        let result = self.redeem_code_inner(code, staff).await;

        #[cfg(feature = "metrics")]
        self.record_attempt(RedemptionChannel::Code, &result, start).await;

        result
    }

    async fn redeem_token_inner(
        &self,
        token: &str,
        tag: &str,
        staff: &StaffMember,
    ) -> Result<RedemptionResult, VoucherError> {
        let payload = self.signer().verify(token, tag)?;

        let kind = match payload.voucher_type().map(str::parse::<VoucherKind>) {
            Some(Ok(kind)) if kind.accepts_qr() => kind,
            Some(Ok(kind)) => {
                tracing::debug!(%kind, "voucher kind is not redeemable by QR");
                return Err(VoucherError::NotFound);
            }
            _ => {
                tracing::debug!("signed payload has no supported voucher type");
                return Err(VoucherError::NotFound);
            }
        };

        let Some(id) = payload.get_id(kind.id_field()) else {
            tracing::debug!(%kind, "signed payload is missing {}", kind.id_field());
            return Err(VoucherError::NotFound);
        };

        let Some(voucher) = self.store().find_by_id(kind, &id).await? else {
            tracing::debug!(%kind, voucher_id = %id, "no voucher for signed payload");
            return Err(VoucherError::NotFound);
        };

        if !payload_matches_record(&payload, &voucher) {
            tracing::debug!(%kind, voucher_id = %id, "signed payload disagrees with stored voucher");
            return Err(VoucherError::NotFound);
        }

        self.complete_redemption(voucher, RedemptionChannel::Token, staff)
            .await
    }

    async fn redeem_code_inner(
        &self,
        code: &str,
        staff: &StaffMember,
    ) -> Result<RedemptionResult, VoucherError> {
        let lookup = normalize_lookup(code);
        if lookup.is_empty() {
            tracing::debug!("empty redemption code");
            return Err(VoucherError::NotFound);
        }

        // A code typed without dashes gets a second probe in the stored shape
        let regrouped = regroup_lookup(code).filter(|r| *r != lookup);
        let probes: Vec<String> = std::iter::once(lookup).chain(regrouped).collect();

        let mut found = None;
        'probe: for probe in &probes {
            for kind in VoucherKind::REDEMPTION_ORDER {
                if let Some(voucher) = self.store().find_by_friendly_code_or_id(kind, probe).await? {
                    found = Some(voucher);
                    break 'probe;
                }
            }
        }

        let Some(voucher) = found else {
            tracing::debug!("no voucher matches redemption code");
            return Err(VoucherError::NotFound);
        };

        if let Some(stored) = &voucher.friendly_code {
            if !self.signer().friendly_codes().matches(stored, &voucher.payload()) {
                tracing::warn!(
                    kind = %voucher.kind(),
                    voucher_id = %voucher.id,
                    "stored friendly code does not match re-derived code"
                );
            }
        }

        self.complete_redemption(voucher, RedemptionChannel::Code, staff)
            .await
    }

    /// Checks, transitions and audits a resolved voucher.
    async fn complete_redemption(
        &self,
        mut voucher: Voucher,
        channel: RedemptionChannel,
        staff: &StaffMember,
    ) -> Result<RedemptionResult, VoucherError> {
        let kind = voucher.kind();
        let now = time_utils::current_timestamp()?;

        if let Err(e) = voucher.ensure_redeemable(now, self.enforce_expiry) {
            tracing::debug!(%kind, voucher_id = %voucher.id, %channel, error = %e, "voucher rejected");
            return Err(e);
        }

        let (changed, retries) = self.transition_with_retry(kind, &voucher.id, now).await?;
        if changed == 0 {
            let e = self.classify_unchanged(kind, &voucher.id, now).await;
            if retries > 0 {
                // The failed attempt may have committed; its history row would then be missing
                tracing::error!(
                    %kind,
                    voucher_id = %voucher.id,
                    %channel,
                    admin_id = %staff.id,
                    error = %e,
                    "retried transition changed nothing; reconcile redemption history"
                );
            } else {
                tracing::debug!(%kind, voucher_id = %voucher.id, %channel, error = %e, "voucher rejected");
            }
            return Err(e);
        }
        voucher.mark_redeemed(now);

        let member_name = self.resolve_member_name(&voucher.member_id).await;
        let proof_url = self.generate_proof(&voucher, &member_name, now, staff).await;
        let history_id = self
            .record_history(&voucher, &member_name, now, staff, proof_url.clone())
            .await;

        tracing::info!(
            %kind,
            voucher_id = %voucher.id,
            %channel,
            admin_id = %staff.id,
            "voucher redeemed"
        );

        Ok(RedemptionResult {
            voucher_kind: kind,
            voucher_id: voucher.id.clone(),
            member_id: voucher.member_id.clone(),
            member_name,
            voucher_label: voucher.label().to_string(),
            redeemed_at: now,
            proof_url,
            history_id,
            voucher,
        })
    }

    /// Runs the conditional transition, retrying a storage failure once.
    ///
    /// Returns the changed-row count and how many retries it took.
    async fn transition_with_retry(
        &self,
        kind: VoucherKind,
        id: &str,
        redeemed_at: i64,
    ) -> Result<(u64, u32), VoucherError> {
        let mut retries = 0;
        loop {
            match self.store().transition_to_redeemed(kind, id, redeemed_at).await {
                Ok(changed) => return Ok((changed, retries)),
                Err(e) if e.is_retryable() && retries < MAX_TRANSITION_RETRIES => {
                    retries += 1;
                    tracing::warn!(%kind, voucher_id = %id, error = %e, "retrying voucher transition");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Explains why the conditional transition changed nothing.
    ///
    /// Anything that is still redeemable on re-read lost a race (or an earlier
    /// attempt of this request committed before its error), so it is reported
    /// as already redeemed.
    async fn classify_unchanged(&self, kind: VoucherKind, id: &str, now: i64) -> VoucherError {
        match self.store().find_by_id(kind, id).await {
            Ok(None) => VoucherError::NotFound,
            Ok(Some(current)) => match current.ensure_redeemable(now, false) {
                Err(e) => e,
                Ok(()) => VoucherError::AlreadyRedeemed,
            },
            Err(e) => e,
        }
    }

    async fn resolve_member_name(&self, member_id: &str) -> String {
        match self.store().find_member(member_id).await {
            Ok(Some(member)) => member.name,
            Ok(None) => {
                tracing::warn!(member_id, "member record missing; using member id as name");
                member_id.to_string()
            }
            Err(e) => {
                tracing::warn!(member_id, error = %e, "member lookup failed; using member id as name");
                member_id.to_string()
            }
        }
    }

    async fn generate_proof(
        &self,
        voucher: &Voucher,
        member_name: &str,
        redeemed_at: i64,
        staff: &StaffMember,
    ) -> Option<String> {
        let qr_url = match self.signer().sign_and_derive(&voucher.payload()) {
            Ok(credentials) => Some(credentials.qr_url(self.issuer.verify_endpoint())),
            Err(e) => {
                tracing::warn!(voucher_id = %voucher.id, error = %e, "could not rebuild QR url for proof");
                None
            }
        };

        let request = ProofRequest {
            kind_label: voucher.kind().display_label().to_string(),
            member_name: member_name.to_string(),
            voucher_label: voucher.label().to_string(),
            redeemed_at,
            admin_name: staff.name.clone(),
            qr_url,
        };

        match self.audit.generate_proof(&request).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(
                    kind = %voucher.kind(),
                    voucher_id = %voucher.id,
                    error = %e,
                    "proof generation failed after redemption"
                );
                #[cfg(feature = "metrics")]
                self.metrics_collector
                    .record_event(MetricEvent::AuditFailure {
                        stage: AuditStage::Proof,
                    })
                    .await;
                None
            }
        }
    }

    async fn record_history(
        &self,
        voucher: &Voucher,
        member_name: &str,
        redeemed_at: i64,
        staff: &StaffMember,
        proof_url: Option<String>,
    ) -> Option<String> {
        let entry = NewRedeemHistory {
            member_id: voucher.member_id.clone(),
            member_name: member_name.to_string(),
            voucher_type: voucher.kind(),
            voucher_id: voucher.id.clone(),
            voucher_label: voucher.label().to_string(),
            redeemed_at,
            admin_id: staff.id.clone(),
            admin_name: staff.name.clone(),
            proof_url,
        };

        match self.audit.record_history(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(
                    kind = %voucher.kind(),
                    voucher_id = %voucher.id,
                    error = %e,
                    "redemption history write failed; voucher stays redeemed"
                );
                #[cfg(feature = "metrics")]
                self.metrics_collector
                    .record_event(MetricEvent::AuditFailure {
                        stage: AuditStage::History,
                    })
                    .await;
                None
            }
        }
    }

    #[cfg(feature = "metrics")]
    async fn record_attempt(
        &self,
        channel: RedemptionChannel,
        result: &Result<RedemptionResult, VoucherError>,
        start: Instant,
    ) {
        let kind = result.as_ref().ok().map(|r| r.voucher_kind);
        self.metrics_collector
            .record_event(MetricEvent::RedemptionAttempt {
                channel,
                kind,
                duration: start.elapsed(),
                success: result.is_ok(),
            })
            .await;
        if let Err(e) = result {
            self.metrics_collector
                .record_event(MetricEvent::Error {
                    error_code: e.code(),
                })
                .await;
        }
    }
}

/// Cross-checks the owner and event named by a signed payload.
fn payload_matches_record(payload: &Payload, voucher: &Voucher) -> bool {
    if payload.get_id("memberId").as_deref() != Some(voucher.member_id.as_str()) {
        return false;
    }
    match voucher.kind() {
        VoucherKind::Event => payload.get_id("eventId").as_deref() == voucher.event_id(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voucher::record::{Member, VoucherDetails, VoucherStatus};
    use crate::voucher::storage::StorageStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECRET: &str = "dispatcher-test-secret-0123456789";

    async fn dispatcher() -> RedemptionDispatcher<MemoryVoucherStore, MemoryAuditLog> {
        RedemptionDispatcher::builder(VoucherConfig::new(SECRET))
            .build_and_init()
            .await
            .unwrap()
    }

    fn staff() -> StaffMember {
        StaffMember::new("a1", "Front Desk")
    }

    fn ticket(id: &str, member_id: &str) -> Voucher {
        Voucher::new(
            id,
            member_id,
            VoucherDetails::Ticket {
                ticket_name: "Museum Entry".to_string(),
                valid_date: None,
            },
        )
    }

    fn registration(id: &str, event_id: &str) -> Voucher {
        Voucher::new(
            id,
            "m1",
            VoucherDetails::Event {
                event_id: event_id.to_string(),
                event_name: "Night Market".to_string(),
            },
        )
    }

    fn booking(id: &str, status: VoucherStatus) -> Voucher {
        Voucher::new(
            id,
            "m1",
            VoucherDetails::Tourism {
                destination: "Island Tour".to_string(),
                quantity: 2,
                visit_date: None,
                payment_ref: Some("pay-1".to_string()),
            },
        )
        .with_status(status)
    }

    #[tokio::test]
    async fn test_redeem_by_token_then_replay() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        dispatcher.store().upsert_member(&Member::new("m1", "Ayu")).await?;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await?;
        assert_eq!(result.voucher_kind, VoucherKind::Ticket);
        assert_eq!(result.member_name, "Ayu");
        assert_eq!(result.voucher_label, "Museum Entry");
        assert_eq!(result.voucher.status, VoucherStatus::Redeemed);
        assert!(result.proof_url.is_some());
        assert!(result.history_id.is_some());

        let replay = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await;
        assert!(matches!(replay, Err(VoucherError::AlreadyRedeemed)));
        assert_eq!(dispatcher.audit().histories().await.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_token_bad_tag() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let other = VoucherSigner::new("other-secret".into()).sign(&issued.voucher.payload())?;
        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &other.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::InvalidSignature)));

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(!stored.is_redeemed());
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_token_member_mismatch() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        // Validly signed, but names another member
        let forged = dispatcher.signer().sign(&ticket("t1", "m2").payload())?;
        let result = dispatcher
            .redeem_by_token(&forged.token, &forged.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_token_event_mismatch() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        dispatcher.issuer().issue(registration("g1", "e1")).await?;

        let forged = dispatcher.signer().sign(&registration("g1", "e2").payload())?;
        let result = dispatcher
            .redeem_by_token(&forged.token, &forged.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotFound)));

        let genuine = dispatcher.signer().sign(&registration("g1", "e1").payload())?;
        let result = dispatcher
            .redeem_by_token(&genuine.token, &genuine.tag, &staff())
            .await?;
        assert_eq!(result.voucher_kind, VoucherKind::Event);
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_token_rejects_code_only_kinds() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher
            .issuer()
            .issue(booking("b1", VoucherStatus::Paid))
            .await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotFound)));

        // Same booking is redeemable by code
        let result = dispatcher
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await?;
        assert_eq!(result.voucher_kind, VoucherKind::Tourism);
        assert_eq!(result.voucher.status, VoucherStatus::Paid);
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_token_unknown_type() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let payload = Payload::new("coupon").with("memberId", "m1").with("couponId", "c1");
        let signed = dispatcher.signer().sign(&payload)?;

        let result = dispatcher
            .redeem_by_token(&signed.token, &signed.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_code_normalizes_input() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let typed = format!("  {}  ", issued.credentials.friendly_code.to_uppercase());
        let result = dispatcher.redeem_by_code(&typed, &staff()).await?;
        assert_eq!(result.voucher_id, "t1");
        // No member record: the id stands in for the name
        assert_eq!(result.member_name, "m1");
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_code_legacy_id() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        dispatcher.store().insert(&ticket("LEGACY-42", "m1")).await?;

        let result = dispatcher.redeem_by_code("legacy-42", &staff()).await?;
        assert_eq!(result.voucher_id, "LEGACY-42");
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_by_code_empty_and_unknown() {
        let dispatcher = dispatcher().await;
        assert!(matches!(
            dispatcher.redeem_by_code("   ", &staff()).await,
            Err(VoucherError::NotFound)
        ));
        assert!(matches!(
            dispatcher.redeem_by_code("0000-0000-0000", &staff()).await,
            Err(VoucherError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_unpaid_booking_not_redeemable() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher
            .issuer()
            .issue(booking("b1", VoucherStatus::Pending))
            .await?;

        let result = dispatcher
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotRedeemable(_))));
        assert!(dispatcher.audit().histories().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_voucher_not_redeemable() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher
            .issuer()
            .issue(ticket("t1", "m1").with_status(VoucherStatus::Cancelled))
            .await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotRedeemable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_enforced_only_when_configured() -> Result<(), VoucherError> {
        let expired = Voucher::new(
            "p1",
            "m1",
            VoucherDetails::Benefit {
                benefit_name: "Free Coffee".to_string(),
                promo_id: "promo-1".to_string(),
                promo_ends_at: Some(1),
            },
        );

        let lenient = dispatcher().await;
        let issued = lenient.issuer().issue(expired.clone()).await?;
        lenient
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await?;

        let strict = RedemptionDispatcher::builder(
            VoucherConfig::new(SECRET).with_enforce_expiry(true),
        )
        .build_and_init()
        .await?;
        let issued = strict.issuer().issue(expired).await?;
        let result = strict
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::NotRedeemable(_))));
        Ok(())
    }

    #[derive(Clone, Copy)]
    enum TransitionFault {
        /// Fails without touching the record
        Fail(fn() -> VoucherError),
        /// Commits the transition, then reports a storage error
        CommitThenFail,
    }

    /// Memory store whose first `failures` transitions misbehave.
    struct FlakyStore {
        inner: MemoryVoucherStore,
        fault: TransitionFault,
        failures: AtomicU32,
        transition_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(fault: TransitionFault, failures: u32) -> Self {
            Self {
                inner: MemoryVoucherStore::new(),
                fault,
                failures: AtomicU32::new(failures),
                transition_calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.transition_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VoucherStore for FlakyStore {
        async fn insert(&self, voucher: &Voucher) -> Result<(), VoucherError> {
            self.inner.insert(voucher).await
        }

        async fn find_by_id(
            &self,
            kind: VoucherKind,
            id: &str,
        ) -> Result<Option<Voucher>, VoucherError> {
            self.inner.find_by_id(kind, id).await
        }

        async fn find_by_friendly_code_or_id(
            &self,
            kind: VoucherKind,
            code: &str,
        ) -> Result<Option<Voucher>, VoucherError> {
            self.inner.find_by_friendly_code_or_id(kind, code).await
        }

        async fn transition_to_redeemed(
            &self,
            kind: VoucherKind,
            id: &str,
            redeemed_at: i64,
        ) -> Result<u64, VoucherError> {
            self.transition_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !failing {
                return self.inner.transition_to_redeemed(kind, id, redeemed_at).await;
            }
            match self.fault {
                TransitionFault::Fail(make_error) => Err(make_error()),
                TransitionFault::CommitThenFail => {
                    self.inner.transition_to_redeemed(kind, id, redeemed_at).await?;
                    Err(VoucherError::from_database_message("connection reset after commit"))
                }
            }
        }

        async fn upsert_member(&self, member: &Member) -> Result<(), VoucherError> {
            self.inner.upsert_member(member).await
        }

        async fn find_member(&self, member_id: &str) -> Result<Option<Member>, VoucherError> {
            self.inner.find_member(member_id).await
        }

        async fn get_stats(&self) -> Result<StorageStats, VoucherError> {
            self.inner.get_stats().await
        }
    }

    fn database_down() -> VoucherError {
        VoucherError::from_database_message("database is locked")
    }

    fn bad_encoding() -> VoucherError {
        VoucherError::EncodingError("row could not be encoded".to_string())
    }

    async fn flaky_dispatcher(
        fault: TransitionFault,
        failures: u32,
    ) -> RedemptionDispatcher<FlakyStore, MemoryAuditLog> {
        RedemptionDispatcher::builder(VoucherConfig::new(SECRET))
            .with_store(Arc::new(FlakyStore::new(fault, failures)))
            .build_and_init()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transition_retried_once_after_storage_error() -> Result<(), VoucherError> {
        let dispatcher = flaky_dispatcher(TransitionFault::Fail(database_down), 1).await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await?;
        assert_eq!(result.voucher_id, "t1");
        assert_eq!(dispatcher.store().calls(), 2);
        assert_eq!(dispatcher.audit().histories().await.len(), 1);

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(stored.is_redeemed());
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_gives_up_after_one_retry() -> Result<(), VoucherError> {
        let dispatcher = flaky_dispatcher(TransitionFault::Fail(database_down), 2).await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::DatabaseError(_))));
        assert_eq!(dispatcher.store().calls(), 2);
        assert!(dispatcher.audit().histories().await.is_empty());

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(!stored.is_redeemed());
        Ok(())
    }

    #[tokio::test]
    async fn test_non_storage_transition_error_not_retried() -> Result<(), VoucherError> {
        let dispatcher = flaky_dispatcher(TransitionFault::Fail(bad_encoding), 1).await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::EncodingError(_))));
        assert_eq!(dispatcher.store().calls(), 1);

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(!stored.is_redeemed());
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_reported_as_error_surfaces_already_redeemed() -> Result<(), VoucherError> {
        let dispatcher = flaky_dispatcher(TransitionFault::CommitThenFail, 1).await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        // Indistinguishable from a lost race; logged for reconciliation
        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await;
        assert!(matches!(result, Err(VoucherError::AlreadyRedeemed)));
        assert_eq!(dispatcher.store().calls(), 2);
        assert!(dispatcher.audit().histories().await.is_empty());

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(stored.is_redeemed());
        Ok(())
    }

    /// Audit log whose every call fails.
    struct BrokenAudit;

    #[async_trait]
    impl RedemptionAudit for BrokenAudit {
        async fn record_history(&self, _entry: NewRedeemHistory) -> Result<String, VoucherError> {
            Err(VoucherError::from_database_message("history table unavailable"))
        }

        async fn generate_proof(&self, _request: &ProofRequest) -> Result<String, VoucherError> {
            Err(VoucherError::from_database_message("file store unavailable"))
        }
    }

    #[tokio::test]
    async fn test_audit_failure_keeps_redemption() -> Result<(), VoucherError> {
        let dispatcher = RedemptionDispatcher::builder(VoucherConfig::new(SECRET))
            .with_audit(Arc::new(BrokenAudit))
            .build_and_init()
            .await?;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_token(&issued.credentials.token, &issued.credentials.tag, &staff())
            .await?;
        assert!(result.proof_url.is_none());
        assert!(result.history_id.is_none());

        let stored = dispatcher.store().find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert!(stored.is_redeemed());
        Ok(())
    }

    #[tokio::test]
    async fn test_history_carries_proof_url() -> Result<(), VoucherError> {
        let dispatcher = dispatcher().await;
        let issued = dispatcher.issuer().issue(ticket("t1", "m1")).await?;

        let result = dispatcher
            .redeem_by_code(&issued.credentials.friendly_code, &staff())
            .await?;

        let history = dispatcher.audit().history_for(VoucherKind::Ticket, "t1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].proof_url, result.proof_url);
        assert_eq!(history[0].admin_id, "a1");
        assert_eq!(history[0].voucher_label, "Museum Entry");

        let proof = dispatcher
            .audit()
            .proof(result.proof_url.as_deref().unwrap())
            .await
            .unwrap();
        assert!(proof.contains("Free Entry Ticket"));
        assert!(proof.contains(&issued.qr_url));
        Ok(())
    }
}
