//! In-memory storage backend implementation.
//!
//! Ideal for testing, development, and single-instance deployments where
//! persistence across restarts is not required.

use super::{StorageStats, VoucherStore};
use crate::voucher::error::VoucherError;
use crate::voucher::record::{Member, Voucher, VoucherKind, VoucherStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type VoucherKey = (VoucherKind, String);

/// A simple in-memory voucher store.
///
/// Vouchers are keyed by `(kind, id)`. The conditional redemption update runs
/// under the write lock, so concurrent redemptions of one voucher are
/// serialized and exactly one of them observes a changed record.
///
/// # Example
///
/// ```rust
/// use voucher_redeem::storage::{MemoryVoucherStore, VoucherStore};
/// use voucher_redeem::{Voucher, VoucherDetails, VoucherKind};
///
/// # async fn example() -> Result<(), voucher_redeem::VoucherError> {
/// let store = MemoryVoucherStore::new();
/// let voucher = Voucher::new("t1", "m1", VoucherDetails::Ticket {
///     ticket_name: "Museum Entry".to_string(),
///     valid_date: None,
/// });
/// store.insert(&voucher).await?;
///
/// assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t1", 100).await?, 1);
/// assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t1", 101).await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryVoucherStore {
    vouchers: Arc<RwLock<HashMap<VoucherKey, Voucher>>>,
    members: Arc<RwLock<HashMap<String, Member>>>,
}

impl MemoryVoucherStore {
    /// Creates a new in-memory storage instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(kind: VoucherKind, id: &str) -> VoucherKey {
        (kind, id.to_string())
    }
}

#[async_trait]
impl VoucherStore for MemoryVoucherStore {
    async fn insert(&self, voucher: &Voucher) -> Result<(), VoucherError> {
        let key = Self::make_key(voucher.kind(), &voucher.id);
        let mut vouchers = self.vouchers.write().await;
        if vouchers.contains_key(&key) {
            return Err(VoucherError::from_database_message(format!(
                "{} {} already exists",
                voucher.kind(),
                voucher.id
            )));
        }
        vouchers.insert(key, voucher.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        kind: VoucherKind,
        id: &str,
    ) -> Result<Option<Voucher>, VoucherError> {
        let vouchers = self.vouchers.read().await;
        Ok(vouchers.get(&Self::make_key(kind, id)).cloned())
    }

    async fn find_by_friendly_code_or_id(
        &self,
        kind: VoucherKind,
        code: &str,
    ) -> Result<Option<Voucher>, VoucherError> {
        let vouchers = self.vouchers.read().await;
        let mut by_id = None;

        for voucher in vouchers.values().filter(|v| v.kind() == kind) {
            let code_matches = voucher
                .friendly_code
                .as_deref()
                .is_some_and(|stored| stored.eq_ignore_ascii_case(code));
            if code_matches {
                return Ok(Some(voucher.clone()));
            }
            if by_id.is_none() && voucher.id.eq_ignore_ascii_case(code) {
                by_id = Some(voucher.clone());
            }
        }

        Ok(by_id)
    }

    async fn transition_to_redeemed(
        &self,
        kind: VoucherKind,
        id: &str,
        redeemed_at: i64,
    ) -> Result<u64, VoucherError> {
        let mut vouchers = self.vouchers.write().await;
        let Some(voucher) = vouchers.get_mut(&Self::make_key(kind, id)) else {
            return Ok(0);
        };

        let guard = match kind {
            VoucherKind::Tourism => {
                voucher.status == VoucherStatus::Paid && voucher.redeemed_at.is_none()
            }
            _ => matches!(voucher.status, VoucherStatus::Active | VoucherStatus::Pending),
        };
        if !guard {
            return Ok(0);
        }

        voucher.mark_redeemed(redeemed_at);
        Ok(1)
    }

    async fn upsert_member(&self, member: &Member) -> Result<(), VoucherError> {
        let mut members = self.members.write().await;
        members.insert(member.id.clone(), member.clone());
        Ok(())
    }

    async fn find_member(&self, member_id: &str) -> Result<Option<Member>, VoucherError> {
        let members = self.members.read().await;
        Ok(members.get(member_id).cloned())
    }

    async fn get_stats(&self) -> Result<StorageStats, VoucherError> {
        let vouchers = self.vouchers.read().await;
        let redeemed = vouchers.values().filter(|v| v.is_redeemed()).count();
        Ok(StorageStats {
            total_vouchers: vouchers.len(),
            redeemed_vouchers: redeemed,
            backend_info: format!(
                "In-memory HashMap storage ({} members)",
                self.members.read().await.len()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voucher::record::VoucherDetails;

    fn ticket(id: &str) -> Voucher {
        Voucher::new(
            id,
            "m1",
            VoucherDetails::Ticket {
                ticket_name: "Museum Entry".to_string(),
                valid_date: None,
            },
        )
    }

    fn booking(id: &str, status: VoucherStatus) -> Voucher {
        Voucher::new(
            id,
            "m1",
            VoucherDetails::Tourism {
                destination: "Island Tour".to_string(),
                quantity: 1,
                visit_date: None,
                payment_ref: None,
            },
        )
        .with_status(status)
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.insert(&ticket("t1")).await?;

        let found = store.find_by_id(VoucherKind::Ticket, "t1").await?;
        assert_eq!(found, Some(ticket("t1")));

        // Same id under another kind is a different voucher
        assert!(store.find_by_id(VoucherKind::Points, "t1").await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_duplicate_insert() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.insert(&ticket("t1")).await?;

        let result = store.insert(&ticket("t1")).await;
        assert!(matches!(result, Err(VoucherError::DatabaseError(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_code_lookup() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        let mut coded = ticket("t1");
        coded.friendly_code = Some("ab12-cd34-ef56".to_string());
        store.insert(&coded).await?;
        store.insert(&ticket("LEGACY-7")).await?;

        let found = store
            .find_by_friendly_code_or_id(VoucherKind::Ticket, "AB12-CD34-EF56")
            .await?;
        assert_eq!(found.map(|v| v.id), Some("t1".to_string()));

        // Legacy record without friendly code, found by raw id
        let found = store
            .find_by_friendly_code_or_id(VoucherKind::Ticket, "legacy-7")
            .await?;
        assert_eq!(found.map(|v| v.id), Some("LEGACY-7".to_string()));

        assert!(
            store
                .find_by_friendly_code_or_id(VoucherKind::Points, "AB12-CD34-EF56")
                .await?
                .is_none()
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_conditional_transition() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.insert(&ticket("t1")).await?;

        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t1", 100).await?, 1);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t1", 200).await?, 0);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "nope", 200).await?, 0);

        let stored = store.find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert_eq!(stored.status, VoucherStatus::Redeemed);
        assert_eq!(stored.redeemed_at, Some(100));

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_transition_skips_closed_vouchers() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.insert(&ticket("t1").with_status(VoucherStatus::Cancelled)).await?;
        store.insert(&ticket("t2").with_status(VoucherStatus::Expired)).await?;
        store.insert(&ticket("t3").with_status(VoucherStatus::Pending)).await?;

        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t1", 100).await?, 0);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t2", 100).await?, 0);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Ticket, "t3", 100).await?, 1);

        let stored = store.find_by_id(VoucherKind::Ticket, "t1").await?.unwrap();
        assert_eq!(stored.status, VoucherStatus::Cancelled);
        assert!(stored.redeemed_at.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_tourism_guard() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.insert(&booking("b1", VoucherStatus::Pending)).await?;
        store.insert(&booking("b2", VoucherStatus::Paid)).await?;

        assert_eq!(store.transition_to_redeemed(VoucherKind::Tourism, "b1", 100).await?, 0);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Tourism, "b2", 100).await?, 1);
        assert_eq!(store.transition_to_redeemed(VoucherKind::Tourism, "b2", 101).await?, 0);

        let stored = store.find_by_id(VoucherKind::Tourism, "b2").await?.unwrap();
        assert_eq!(stored.status, VoucherStatus::Paid);
        assert_eq!(stored.redeemed_at, Some(100));

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_concurrent_transition() -> Result<(), VoucherError> {
        let store = Arc::new(MemoryVoucherStore::new());
        store.insert(&ticket("t1")).await?;

        let mut handles = vec![];
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition_to_redeemed(VoucherKind::Ticket, "t1", 100 + i)
                    .await
            }));
        }

        let mut changed = 0;
        for handle in handles {
            changed += handle.await.unwrap()?;
        }
        assert_eq!(changed, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_members_and_stats() -> Result<(), VoucherError> {
        let store = MemoryVoucherStore::new();
        store.upsert_member(&Member::new("m1", "Ayu")).await?;
        store.upsert_member(&Member::new("m1", "Ayu Lestari")).await?;
        assert_eq!(store.find_member("m1").await?.unwrap().name, "Ayu Lestari");
        assert!(store.find_member("m2").await?.is_none());

        store.insert(&ticket("t1")).await?;
        store.insert(&ticket("t2")).await?;
        store.transition_to_redeemed(VoucherKind::Ticket, "t1", 1).await?;

        let stats = store.get_stats().await?;
        assert_eq!(stats.total_vouchers, 2);
        assert_eq!(stats.redeemed_vouchers, 1);
        assert!(stats.backend_info.contains("In-memory"));

        Ok(())
    }
}
