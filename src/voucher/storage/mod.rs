//! Pluggable storage backends for vouchers and members.
//!
//! The voucher store is an external collaborator of the redemption engine: the
//! engine only needs lookups and a single conditional transition per voucher
//! kind. The available backends depend on the enabled features.

use crate::voucher::error::VoucherError;
use crate::voucher::record::{Member, Voucher, VoucherKind};
use async_trait::async_trait;

// Always available
mod memory;
pub use memory::MemoryVoucherStore;

// Feature-gated storage backends
#[cfg(feature = "sqlite-storage")]
mod sqlite;
#[cfg(feature = "sqlite-storage")]
pub use sqlite::SqliteVoucherStore;

/// Statistics about the voucher storage backend.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Total number of voucher records across all kinds
    pub total_vouchers: usize,
    /// Number of vouchers that have been redeemed
    pub redeemed_vouchers: usize,
    /// Additional backend-specific information
    pub backend_info: String,
}

/// Abstract storage backend for voucher persistence.
///
/// # Available Implementations
///
/// - [`MemoryVoucherStore`] - Always available, in-memory HashMap-based storage
/// - `SqliteVoucherStore` - Available with `sqlite-storage` feature, persistent SQLite storage
///
/// # Atomicity
///
/// [`transition_to_redeemed`](VoucherStore::transition_to_redeemed) is the only
/// write on the redemption path. It must check redeemability and update the
/// record as one atomic step and report how many records it changed. Two
/// concurrent calls for the same voucher must never both return `1`.
///
/// # Error Handling
///
/// All methods return `Result<T, VoucherError>` and should map backend-specific
/// errors to `VoucherError::DatabaseError`.
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Optional method for storage backend initialization.
    ///
    /// Implementations can use this for tasks like schema creation,
    /// connection setup, etc.
    async fn init(&self) -> Result<(), VoucherError> {
        Ok(())
    }

    /// Persists a newly issued voucher.
    ///
    /// Fails with `DatabaseError` if a voucher of the same kind and id exists.
    async fn insert(&self, voucher: &Voucher) -> Result<(), VoucherError>;

    /// Looks up a voucher by its kind-specific id. The comparison is exact.
    async fn find_by_id(&self, kind: VoucherKind, id: &str)
    -> Result<Option<Voucher>, VoucherError>;

    /// Looks up a voucher by stored friendly code, falling back to raw id.
    ///
    /// Both comparisons are case-insensitive. A friendly-code match takes
    /// precedence over an id match.
    async fn find_by_friendly_code_or_id(
        &self,
        kind: VoucherKind,
        code: &str,
    ) -> Result<Option<Voucher>, VoucherError>;

    /// Atomically marks a voucher redeemed if it is still redeemable.
    ///
    /// For tourism bookings the guard is `status == PAID AND redeemed_at IS NULL`
    /// and only `redeemed_at` is written. For every other kind the guard is
    /// `status IN (ACTIVE, PENDING)` and both `status` and `redeemed_at` are
    /// written.
    ///
    /// # Returns
    ///
    /// * `Ok(1)` - The voucher was transitioned by this call
    /// * `Ok(0)` - The voucher does not exist or was not redeemable
    /// * `Err(VoucherError)` - If there was an error accessing storage
    async fn transition_to_redeemed(
        &self,
        kind: VoucherKind,
        id: &str,
        redeemed_at: i64,
    ) -> Result<u64, VoucherError>;

    /// Inserts or replaces a member record.
    async fn upsert_member(&self, member: &Member) -> Result<(), VoucherError>;

    async fn find_member(&self, member_id: &str) -> Result<Option<Member>, VoucherError>;

    /// Returns statistics about the storage backend.
    async fn get_stats(&self) -> Result<StorageStats, VoucherError>;
}
