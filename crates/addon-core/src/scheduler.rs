//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::collaborators::Collaborators;
use crate::error::{LifecycleError, Result};
use crate::metrics::TransactionMetrics;
use crate::status::AffectedAddOn;
use crate::transaction::{Operation, Transaction, TransactionInfo, TransactionSettings};

/// Grants at most one open lifecycle transaction device-wide.
///
/// Status readers share the slot lock; only opening and releasing take it
/// exclusively.
#[derive(Debug)]
pub struct TransactionScheduler {
    current: RwLock<Option<Arc<TransactionInfo>>>,
    settings: TransactionSettings,
    metrics: Option<TransactionMetrics>,
}

impl TransactionScheduler {
    pub fn new(settings: TransactionSettings, metrics: Option<TransactionMetrics>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(None),
            settings,
            metrics,
        })
    }

    /// Open a transaction for `operation` on `name`.
    ///
    /// Fails with [`LifecycleError::Busy`] while another transaction is open.
    pub fn create_transaction(
        self: &Arc<Self>,
        name: &str,
        operation: Operation,
        collaborators: Collaborators,
    ) -> Result<Transaction> {
        let info = {
            let mut current = self.current.write();
            if let Some(open) = current.as_ref() {
                debug!(
                    add_on = %name,
                    %operation,
                    open_add_on = %open.name(),
                    open_operation = %open.operation(),
                    "transaction slot busy"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_busy();
                }
                return Err(LifecycleError::Busy {
                    add_on: open.name().to_owned(),
                    operation: open.operation(),
                });
            }
            let info = Arc::new(TransactionInfo::new(name, operation));
            *current = Some(info.clone());
            info
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_open(true);
        }
        info!(transaction_id = %info.id(), add_on = %name, %operation, "transaction opened");
        Ok(Transaction::open(info, collaborators, self.clone()))
    }

    /// The open transaction, if any.
    pub fn get_transaction(&self) -> Option<Arc<TransactionInfo>> {
        self.current.read().clone()
    }

    pub fn is_transaction_open(&self) -> bool {
        self.current.read().is_some()
    }

    /// In-flight status of `name` according to the open transaction.
    pub fn affected_add_on(&self, name: &str) -> Option<AffectedAddOn> {
        self.get_transaction()
            .and_then(|info| info.affected_add_on(name))
    }

    pub fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    pub(crate) fn metrics(&self) -> Option<&TransactionMetrics> {
        self.metrics.as_ref()
    }

    /// Free the slot if it is still held by transaction `id`.
    pub(crate) fn release(&self, id: Uuid) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|open| open.id() == id) {
            *current = None;
            if let Some(metrics) = &self.metrics {
                metrics.set_open(false);
            }
            debug!(transaction_id = %id, "transaction slot released");
        }
    }
}
