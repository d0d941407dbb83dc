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

use prometheus::{self, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::Result;

/// Metrics published by the lifecycle transaction engine.
#[derive(Clone)]
pub struct TransactionMetrics {
    transactions: IntCounterVec,
    busy: IntCounter,
    compensations: IntCounterVec,
    duration: HistogramVec,
    open: IntGauge,
    heartbeats: IntCounterVec,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl TransactionMetrics {
    /// Register all lifecycle metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let transactions = IntCounterVec::new(
            Opts::new(
                "addon_transactions_total",
                "Total number of lifecycle transactions by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(transactions.clone()))?;

        let busy = IntCounter::with_opts(Opts::new(
            "addon_transaction_busy_total",
            "Lifecycle requests rejected because another transaction was open",
        ))?;
        registry.register(Box::new(busy.clone()))?;

        let compensations = IntCounterVec::new(
            Opts::new(
                "addon_compensations_total",
                "Compensating actions executed during rollback",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(compensations.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "addon_transaction_duration_seconds",
            "Wall time from opening a lifecycle transaction to its termination",
        )
        .buckets(prometheus::exponential_buckets(0.05, 2.0, 12)?);
        let duration = HistogramVec::new(histogram_opts, &["operation"])?;
        registry.register(Box::new(duration.clone()))?;

        let open = IntGauge::with_opts(Opts::new(
            "addon_transaction_open",
            "1 while a lifecycle transaction holds the scheduler slot",
        ))?;
        registry.register(Box::new(open.clone()))?;

        let heartbeats = IntCounterVec::new(
            Opts::new(
                "addon_heartbeats_total",
                "Heartbeats emitted while lifecycle operations were running",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(heartbeats.clone()))?;

        Ok(Self {
            transactions,
            busy,
            compensations,
            duration,
            open,
            heartbeats,
            registry,
        })
    }

    /// Record a terminated transaction together with its duration.
    pub fn record_transaction(&self, operation: &str, outcome: &str, seconds: f64) {
        self.transactions
            .with_label_values(&[operation, outcome])
            .inc();
        self.duration.with_label_values(&[operation]).observe(seconds);
    }

    /// Record a request rejected by the single-writer scheduler.
    pub fn record_busy(&self) {
        self.busy.inc();
    }

    /// Record a compensating action and whether it succeeded.
    pub fn record_compensation(&self, kind: &str, succeeded: bool) {
        let outcome = if succeeded { "applied" } else { "failed" };
        self.compensations.with_label_values(&[kind, outcome]).inc();
    }

    /// Flip the open-transaction gauge.
    pub fn set_open(&self, open: bool) {
        self.open.set(i64::from(open));
    }

    /// Record a heartbeat attempt.
    pub fn record_heartbeat(&self, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        self.heartbeats.with_label_values(&[outcome]).inc();
    }
}

impl std::fmt::Debug for TransactionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_exports_families() {
        let registry = Arc::new(Registry::new());
        let metrics = TransactionMetrics::new(registry.clone()).unwrap();
        metrics.record_transaction("installing", "committed", 0.4);
        metrics.record_busy();
        metrics.record_compensation("delete_stack", true);
        metrics.set_open(true);
        metrics.record_heartbeat(false);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        for expected in [
            "addon_transactions_total",
            "addon_transaction_busy_total",
            "addon_compensations_total",
            "addon_transaction_duration_seconds",
            "addon_transaction_open",
            "addon_heartbeats_total",
        ] {
            assert!(names.iter().any(|name| name == expected), "{expected} missing");
        }
    }

    #[test]
    fn double_registration_fails() {
        let registry = Arc::new(Registry::new());
        TransactionMetrics::new(registry.clone()).unwrap();
        assert!(TransactionMetrics::new(registry).is_err());
    }
}
