//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use addon_common::{AppConfig, LifecycleConfig};
use prometheus::Registry;
use tracing::{debug, info};

use crate::collaborators::Collaborators;
use crate::error::Result;
use crate::heartbeat::HeartbeatExecutor;
use crate::metrics::TransactionMetrics;
use crate::scheduler::TransactionScheduler;
use crate::status::{AddOnView, StatusResolver};
use crate::transaction::{InstallRequest, Operation, Transaction, TransactionSettings};

/// Entry point for add-on lifecycle requests.
///
/// Mutations open a transaction, run its routine on the blocking pool and
/// heartbeat the caller until the transaction terminates. Reads never wait
/// for an open transaction.
#[derive(Debug, Clone)]
pub struct LifecycleService {
    scheduler: Arc<TransactionScheduler>,
    collaborators: Collaborators,
    status: StatusResolver,
    heartbeat: HeartbeatExecutor,
}

impl LifecycleService {
    pub fn new(
        config: &LifecycleConfig,
        collaborators: Collaborators,
        metrics: Option<TransactionMetrics>,
    ) -> Self {
        let scheduler = TransactionScheduler::new(TransactionSettings::from(config), metrics.clone());
        let status = StatusResolver::new(scheduler.clone(), collaborators.clone());
        Self {
            scheduler,
            collaborators,
            status,
            heartbeat: HeartbeatExecutor::new(config.heartbeat_interval, metrics),
        }
    }

    /// Build a service from host configuration.
    ///
    /// Transaction metrics are registered on `registry` only when
    /// `metrics.enabled` is set.
    pub fn from_config(
        config: &AppConfig,
        collaborators: Collaborators,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let metrics = if config.metrics.enabled {
            Some(TransactionMetrics::new(registry)?)
        } else {
            debug!("transaction metrics disabled");
            None
        };
        Ok(Self::new(&config.lifecycle, collaborators, metrics))
    }

    pub fn scheduler(&self) -> &Arc<TransactionScheduler> {
        &self.scheduler
    }

    /// Cadence at which mutation callers are heartbeated.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.heartbeat.interval()
    }

    pub async fn install<Hb, Fut, HbErr>(&self, request: InstallRequest, heartbeat: Hb) -> Result<()>
    where
        Hb: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), HbErr>>,
        HbErr: Display,
    {
        let name = request.name.clone();
        self.run(&name, Operation::Installing, heartbeat, move |txn| {
            txn.create_add_on_routine(&request)
        })
        .await
    }

    pub async fn update<Hb, Fut, HbErr>(&self, request: InstallRequest, heartbeat: Hb) -> Result<()>
    where
        Hb: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), HbErr>>,
        HbErr: Display,
    {
        let name = request.name.clone();
        self.run(&name, Operation::Updating, heartbeat, move |txn| {
            txn.replace_add_on_routine(&request)
        })
        .await
    }

    pub async fn delete<Hb, Fut, HbErr>(&self, name: &str, heartbeat: Hb) -> Result<()>
    where
        Hb: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), HbErr>>,
        HbErr: Display,
    {
        let target = name.to_owned();
        self.run(name, Operation::Deleting, heartbeat, move |txn| {
            txn.delete_add_on_routine(&target)
        })
        .await
    }

    pub fn get(&self, name: &str) -> Result<AddOnView> {
        self.status.get_add_on(name)
    }

    pub fn list(&self) -> Result<Vec<AddOnView>> {
        self.status.list_add_ons()
    }

    async fn run<Hb, Fut, HbErr, F>(
        &self,
        name: &str,
        operation: Operation,
        heartbeat: Hb,
        routine: F,
    ) -> Result<()>
    where
        Hb: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), HbErr>>,
        HbErr: Display,
        F: FnOnce(&mut Transaction) -> Result<()> + Send + 'static,
    {
        let transaction =
            self.scheduler
                .create_transaction(name, operation, self.collaborators.clone())?;
        info!(add_on = %name, %operation, transaction_id = %transaction.id(), "lifecycle request accepted");
        self.heartbeat
            .run(move || transaction.execute(routine), heartbeat)
            .await
    }
}
