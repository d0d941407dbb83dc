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

use addon_versioning::AddOnVersion;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collaborators::{CatalogueEntry, Collaborators, ContainerState, ContainerSummary};
use crate::error::{Result, Step, StepExt, ValidationError};
use crate::scheduler::TransactionScheduler;
use crate::transaction::Operation;

/// Status reported for an add-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOnStatus {
    Installing,
    Updating,
    Deleting,
    Running,
    Starting,
    Stopped,
    Error,
}

impl From<Operation> for AddOnStatus {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Installing => AddOnStatus::Installing,
            Operation::Updating => AddOnStatus::Updating,
            Operation::Deleting => AddOnStatus::Deleting,
        }
    }
}

impl AddOnStatus {
    /// Derive the status of an idle add-on from its stack's containers.
    pub fn from_containers(containers: &[ContainerSummary]) -> Self {
        if containers.is_empty() {
            return AddOnStatus::Stopped;
        }
        let failed = containers.iter().any(|container| match container.state {
            ContainerState::Dead => true,
            ContainerState::Exited => container.exit_code.unwrap_or(0) != 0,
            _ => false,
        });
        if failed {
            return AddOnStatus::Error;
        }
        if containers
            .iter()
            .all(|container| container.state == ContainerState::Running)
        {
            return AddOnStatus::Running;
        }
        if containers.iter().all(|container| {
            matches!(container.state, ContainerState::Exited | ContainerState::Created)
        }) {
            return AddOnStatus::Stopped;
        }
        AddOnStatus::Starting
    }
}

/// Add-on targeted by the open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffectedAddOn {
    pub name: String,
    pub title: String,
    pub operation: Operation,
}

impl AffectedAddOn {
    pub fn status(&self) -> AddOnStatus {
        self.operation.into()
    }
}

/// Status view of a single add-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOnView {
    pub name: String,
    pub title: String,
    /// Installed version. Unknown while an install is in flight.
    pub version: Option<AddOnVersion>,
    pub status: AddOnStatus,
}

impl From<AffectedAddOn> for AddOnView {
    fn from(affected: AffectedAddOn) -> Self {
        Self {
            status: affected.status(),
            name: affected.name,
            title: affected.title,
            version: None,
        }
    }
}

/// Answers status queries, preferring the in-flight projection over live state.
#[derive(Debug, Clone)]
pub struct StatusResolver {
    scheduler: Arc<TransactionScheduler>,
    collaborators: Collaborators,
}

impl StatusResolver {
    pub fn new(scheduler: Arc<TransactionScheduler>, collaborators: Collaborators) -> Self {
        Self {
            scheduler,
            collaborators,
        }
    }

    pub fn get_add_on(&self, name: &str) -> Result<AddOnView> {
        if let Some(affected) = self.scheduler.affected_add_on(name) {
            debug!(add_on = %name, operation = %affected.operation, "serving in-flight status");
            return Ok(affected.into());
        }
        let entry = match self.collaborators.catalogue.get_add_on(name) {
            Ok(entry) => entry,
            Err(err) if err.is_not_found() => {
                return Err(ValidationError::NotInstalled(name.to_owned()).into())
            }
            Err(err) => return Err(err).step(Step::LookupAddOn),
        };
        self.view(&entry)
    }

    /// One view per catalogue entry, plus an add-on being installed that is not catalogued yet.
    pub fn list_add_ons(&self) -> Result<Vec<AddOnView>> {
        let open = self.scheduler.get_transaction();
        let entries = self
            .collaborators
            .catalogue
            .list_add_ons()
            .step(Step::LookupAddOn)?;

        let mut views = Vec::with_capacity(entries.len() + 1);
        for entry in &entries {
            let affected = open
                .as_ref()
                .and_then(|info| info.affected_add_on(entry.name()));
            match affected {
                Some(affected) => views.push(AddOnView {
                    version: Some(entry.version().clone()),
                    ..AddOnView::from(affected)
                }),
                None => views.push(self.view(entry)?),
            }
        }
        if let Some(info) = open {
            if !entries.iter().any(|entry| entry.name() == info.name()) {
                if let Some(affected) = info.affected_add_on(info.name()) {
                    views.push(affected.into());
                }
            }
        }
        Ok(views)
    }

    fn view(&self, entry: &CatalogueEntry) -> Result<AddOnView> {
        let containers = self
            .collaborators
            .stacks
            .list_all_stack_containers(entry.name())
            .step(Step::InspectStack)?;
        Ok(AddOnView {
            name: entry.name().to_owned(),
            title: entry.package.manifest.title.clone(),
            version: Some(entry.version().clone()),
            status: AddOnStatus::from_containers(&containers),
        })
    }
}
