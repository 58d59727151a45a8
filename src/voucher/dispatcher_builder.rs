use std::sync::Arc;

use crate::voucher::audit::{MemoryAuditLog, RedemptionAudit};
use crate::voucher::config::VoucherConfig;
use crate::voucher::dispatcher::RedemptionDispatcher;
use crate::voucher::error::VoucherError;
use crate::voucher::storage::{MemoryVoucherStore, VoucherStore};

#[cfg(feature = "metrics")]
use crate::voucher::metrics::MetricsCollector;

/// A builder for creating a `RedemptionDispatcher` instance.
///
/// This builder defaults to `MemoryVoucherStore` and `MemoryAuditLog`.
#[must_use = "The builder does nothing unless `.build_and_init()` is called."]
pub struct RedemptionDispatcherBuilder<S: VoucherStore, A: RedemptionAudit> {
    config: VoucherConfig,
    store: Arc<S>,
    audit: Arc<A>,
    #[cfg(feature = "metrics")]
    metrics_collector: Option<Arc<dyn MetricsCollector>>,
}

impl RedemptionDispatcherBuilder<MemoryVoucherStore, MemoryAuditLog> {
    pub(crate) fn new(config: VoucherConfig) -> Self {
        Self {
            config,
            store: Arc::new(MemoryVoucherStore::new()),
            audit: Arc::new(MemoryAuditLog::new()),
            #[cfg(feature = "metrics")]
            metrics_collector: None,
        }
    }
}

impl<S: VoucherStore, A: RedemptionAudit> RedemptionDispatcherBuilder<S, A> {
    /// Specifies the voucher store to use instead of the default `MemoryVoucherStore`.
    pub fn with_store<T: VoucherStore>(self, store: Arc<T>) -> RedemptionDispatcherBuilder<T, A> {
        RedemptionDispatcherBuilder {
            config: self.config,
            store,
            audit: self.audit,
            #[cfg(feature = "metrics")]
            metrics_collector: self.metrics_collector,
        }
    }

    /// Specifies the history/proof collaborator to use instead of `MemoryAuditLog`.
    pub fn with_audit<T: RedemptionAudit>(self, audit: Arc<T>) -> RedemptionDispatcherBuilder<S, T> {
        RedemptionDispatcherBuilder {
            config: self.config,
            store: self.store,
            audit,
            #[cfg(feature = "metrics")]
            metrics_collector: self.metrics_collector,
        }
    }

    /// Sets the collector receiving issuance and redemption metrics.
    ///
    /// If not set, metrics are discarded.
    #[cfg(feature = "metrics")]
    pub fn with_metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics_collector = Some(collector);
        self
    }

    /// Builds and initializes the `RedemptionDispatcher`.
    ///
    /// Configuration warnings are logged, then the store's `init()` runs (schema
    /// creation for persistent backends).
    pub async fn build_and_init(self) -> Result<RedemptionDispatcher<S, A>, VoucherError> {
        for warning in self.config.validate() {
            tracing::warn!("{warning}");
        }
        tracing::debug!("{}", self.config.summary());

        #[cfg(feature = "metrics")]
        let dispatcher =
            RedemptionDispatcher::new(&self.config, self.store, self.audit, self.metrics_collector);
        #[cfg(not(feature = "metrics"))]
        let dispatcher = RedemptionDispatcher::new(&self.config, self.store, self.audit);

        dispatcher.init().await?;
        Ok(dispatcher)
    }
}
