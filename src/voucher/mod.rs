// Core components
mod config;
mod error;
mod record;
mod time_utils;

// Token integrity
pub mod codec;
pub mod friendly_code;
mod payload;
pub mod signature;

// Collaborators
pub mod audit;
pub mod storage;

// Issuance and redemption
mod dispatcher;
mod dispatcher_builder;
mod issuer;

// Metrics (optional feature)
#[cfg(feature = "metrics")]
pub mod metrics;

// Core components exports
pub use config::{DEFAULT_VERIFY_ENDPOINT, SecretKey, VoucherConfig};
pub use error::VoucherError;
pub use record::{
    Member, RedemptionResult, StaffMember, Voucher, VoucherDetails, VoucherKind, VoucherStatus,
};

// Token integrity exports
pub use friendly_code::FriendlyCodeDeriver;
pub use payload::Payload;
pub use signature::{IssuedCredentials, SignedToken, VoucherSigner};

// Collaborator exports
pub use audit::{MemoryAuditLog, NewRedeemHistory, ProofRequest, RedeemHistory, RedemptionAudit};
pub use storage::{MemoryVoucherStore, StorageStats, VoucherStore};

// Issuance and redemption exports
pub use dispatcher::{RedemptionChannel, RedemptionDispatcher};
pub use dispatcher_builder::RedemptionDispatcherBuilder;
pub use issuer::{IssuedVoucher, VoucherIssuer};

// Metrics exports (optional feature)
#[cfg(feature = "metrics")]
pub use metrics::{
    AuditStage, ErrorMetrics, InMemoryMetricsCollector, MetricEvent, MetricsCollector,
    NoOpMetricsCollector, RedemptionMetrics,
};
