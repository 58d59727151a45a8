//! Metrics collection for issuance and redemption.
//!
//! Metrics collection is optional and enabled via the `metrics` feature.

use crate::voucher::dispatcher::RedemptionChannel;
use crate::voucher::error::VoucherError;
use crate::voucher::record::VoucherKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Post-transition step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStage {
    Proof,
    History,
}

/// Core metrics tracked by the redemption engine.
#[derive(Debug, Clone, Default)]
pub struct RedemptionMetrics {
    /// Vouchers issued through the issuer
    pub vouchers_issued: u64,
    /// Redemption attempts over both channels
    pub redemption_attempts: u64,
    pub redemption_successes: u64,
    pub redemption_failures: u64,
    /// Attempts via QR token
    pub token_attempts: u64,
    /// Attempts via typed code
    pub code_attempts: u64,
    /// Issued vouchers per kind
    pub issued_by_kind: HashMap<VoucherKind, u64>,
    /// Successful redemptions per kind
    pub redeemed_by_kind: HashMap<VoucherKind, u64>,
    /// Proof or history failures after a committed transition
    pub audit_failures: u64,
    pub error_counts: ErrorMetrics,
    /// Average redemption latency (microseconds)
    pub avg_redemption_time_us: u64,
}

/// Error count metrics by category.
#[derive(Debug, Clone, Default)]
pub struct ErrorMetrics {
    pub invalid_signature: u64,
    pub not_found: u64,
    pub already_redeemed: u64,
    pub not_redeemable: u64,
    pub storage_errors: u64,
    pub other_errors: u64,
}

/// Events that can be tracked by the metrics system.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    VoucherIssued {
        kind: VoucherKind,
    },
    RedemptionAttempt {
        channel: RedemptionChannel,
        /// Kind of the resolved voucher, if resolution got that far
        kind: Option<VoucherKind>,
        duration: Duration,
        success: bool,
    },
    AuditFailure {
        stage: AuditStage,
    },
    Error {
        /// [`VoucherError::code`] of the failure
        error_code: &'static str,
    },
}

/// Trait for metrics collection backends.
///
/// All methods must be thread-safe as they may be called concurrently from
/// multiple redemption requests.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Record a metric event. Should be fast and non-blocking.
    async fn record_event(&self, event: MetricEvent);

    /// Get current metrics snapshot.
    async fn get_metrics(&self) -> Result<RedemptionMetrics, VoucherError>;

    /// Reset all metrics to zero.
    async fn reset_metrics(&self) -> Result<(), VoucherError>;
}

const KIND_COUNT: usize = VoucherKind::REDEMPTION_ORDER.len();

fn kind_slot(kind: VoucherKind) -> usize {
    match kind {
        VoucherKind::Ticket => 0,
        VoucherKind::Points => 1,
        VoucherKind::Event => 2,
        VoucherKind::Tourism => 3,
        VoucherKind::Benefit => 4,
    }
}

fn snapshot_by_kind(counters: &[AtomicU64; KIND_COUNT]) -> HashMap<VoucherKind, u64> {
    VoucherKind::REDEMPTION_ORDER
        .into_iter()
        .map(|kind| (kind, counters[kind_slot(kind)].load(Ordering::Relaxed)))
        .filter(|(_, count)| *count > 0)
        .collect()
}

/// In-memory metrics collector using atomic counters.
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    vouchers_issued: AtomicU64,
    redemption_attempts: AtomicU64,
    redemption_successes: AtomicU64,
    redemption_failures: AtomicU64,
    token_attempts: AtomicU64,
    code_attempts: AtomicU64,
    audit_failures: AtomicU64,

    // Per-kind counts, indexed by `kind_slot`
    issued_by_kind: [AtomicU64; KIND_COUNT],
    redeemed_by_kind: [AtomicU64; KIND_COUNT],

    // Error counts
    invalid_signature_errors: AtomicU64,
    not_found_errors: AtomicU64,
    already_redeemed_errors: AtomicU64,
    not_redeemable_errors: AtomicU64,
    storage_errors: AtomicU64,
    other_errors: AtomicU64,

    // Performance tracking
    redemption_time_total: AtomicU64,
    redemption_samples: AtomicU64,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> impl Iterator<Item = &AtomicU64> {
        [
            &self.vouchers_issued,
            &self.redemption_attempts,
            &self.redemption_successes,
            &self.redemption_failures,
            &self.token_attempts,
            &self.code_attempts,
            &self.audit_failures,
            &self.invalid_signature_errors,
            &self.not_found_errors,
            &self.already_redeemed_errors,
            &self.not_redeemable_errors,
            &self.storage_errors,
            &self.other_errors,
            &self.redemption_time_total,
            &self.redemption_samples,
        ]
        .into_iter()
        .chain(&self.issued_by_kind)
        .chain(&self.redeemed_by_kind)
    }
}

#[async_trait]
impl MetricsCollector for InMemoryMetricsCollector {
    async fn record_event(&self, event: MetricEvent) {
        match event {
            MetricEvent::VoucherIssued { kind } => {
                self.vouchers_issued.fetch_add(1, Ordering::Relaxed);
                self.issued_by_kind[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::RedemptionAttempt {
                channel,
                kind,
                duration,
                success,
            } => {
                self.redemption_attempts.fetch_add(1, Ordering::Relaxed);
                match channel {
                    RedemptionChannel::Token => self.token_attempts.fetch_add(1, Ordering::Relaxed),
                    RedemptionChannel::Code => self.code_attempts.fetch_add(1, Ordering::Relaxed),
                };
                if success {
                    self.redemption_successes.fetch_add(1, Ordering::Relaxed);
                    if let Some(kind) = kind {
                        self.redeemed_by_kind[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    self.redemption_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.redemption_time_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
                self.redemption_samples.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::AuditFailure { .. } => {
                self.audit_failures.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Error { error_code } => {
                let counter = match error_code {
                    "invalid_signature" => &self.invalid_signature_errors,
                    "not_found" => &self.not_found_errors,
                    "already_redeemed" => &self.already_redeemed_errors,
                    "not_redeemable" => &self.not_redeemable_errors,
                    "storage_error" => &self.storage_errors,
                    _ => &self.other_errors,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn get_metrics(&self) -> Result<RedemptionMetrics, VoucherError> {
        let samples = self.redemption_samples.load(Ordering::Relaxed);
        let avg_redemption_time_us = if samples > 0 {
            self.redemption_time_total.load(Ordering::Relaxed) / samples
        } else {
            0
        };

        Ok(RedemptionMetrics {
            vouchers_issued: self.vouchers_issued.load(Ordering::Relaxed),
            redemption_attempts: self.redemption_attempts.load(Ordering::Relaxed),
            redemption_successes: self.redemption_successes.load(Ordering::Relaxed),
            redemption_failures: self.redemption_failures.load(Ordering::Relaxed),
            token_attempts: self.token_attempts.load(Ordering::Relaxed),
            code_attempts: self.code_attempts.load(Ordering::Relaxed),
            issued_by_kind: snapshot_by_kind(&self.issued_by_kind),
            redeemed_by_kind: snapshot_by_kind(&self.redeemed_by_kind),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            error_counts: ErrorMetrics {
                invalid_signature: self.invalid_signature_errors.load(Ordering::Relaxed),
                not_found: self.not_found_errors.load(Ordering::Relaxed),
                already_redeemed: self.already_redeemed_errors.load(Ordering::Relaxed),
                not_redeemable: self.not_redeemable_errors.load(Ordering::Relaxed),
                storage_errors: self.storage_errors.load(Ordering::Relaxed),
                other_errors: self.other_errors.load(Ordering::Relaxed),
            },
            avg_redemption_time_us,
        })
    }

    async fn reset_metrics(&self) -> Result<(), VoucherError> {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// No-op metrics collector that discards all metrics.
#[derive(Debug, Default)]
pub struct NoOpMetricsCollector;

impl NoOpMetricsCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsCollector for NoOpMetricsCollector {
    async fn record_event(&self, _event: MetricEvent) {}

    async fn get_metrics(&self) -> Result<RedemptionMetrics, VoucherError> {
        Ok(RedemptionMetrics::default())
    }

    async fn reset_metrics(&self) -> Result<(), VoucherError> {
        Ok(())
    }
}
