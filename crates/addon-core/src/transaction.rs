//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Lifecycle transactions.
//!
//! A [`Transaction`] executes one routine step by step. After every step that
//! took effect it records the compensation undoing that step. Committing
//! discards the compensations; rolling back runs them newest first. Either
//! way the scheduler slot is released exactly once. A transaction dropped
//! while still open rolls back.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use addon_common::LifecycleConfig;
use addon_versioning::{ensure_upgrade, AddOnVersion};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::collaborators::{
    AddOnManifest, AddOnPackage, CatalogueEntry, Collaborators, IamPermission, StackOptions,
};
use crate::compensation::{Compensation, CompensationStack, RollbackReport};
use crate::error::{LifecycleError, Result, Step, StepExt, ValidationError};
use crate::scheduler::TransactionScheduler;
use crate::status::AffectedAddOn;

/// Lifecycle operation performed by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Installing,
    Updating,
    Deleting,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Installing => "installing",
            Operation::Updating => "updating",
            Operation::Deleting => "deleting",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-level knobs applied to every routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSettings {
    pub platform: String,
    /// Push a volume cleanup compensation when installing a stack.
    pub prune_volumes_on_failure: bool,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for TransactionSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            platform: config.platform.clone(),
            prune_volumes_on_failure: config.prune_volumes_on_failure,
        }
    }
}

/// Request to install or update an add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub name: String,
    pub version: AddOnVersion,
    /// Values for settings declared by the manifest.
    pub settings: IndexMap<String, String>,
}

impl InstallRequest {
    pub fn new(name: impl Into<String>, version: AddOnVersion) -> Self {
        Self {
            name: name.into(),
            version,
            settings: IndexMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Read-only view of an open transaction, shared with status readers.
#[derive(Debug)]
pub struct TransactionInfo {
    id: Uuid,
    name: String,
    operation: Operation,
    started_at: DateTime<Utc>,
    title: RwLock<Option<String>>,
}

impl TransactionInfo {
    pub(crate) fn new(name: &str, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            operation,
            started_at: Utc::now(),
            title: RwLock::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Display title of the add-on, or its name until the package is known.
    pub fn title(&self) -> String {
        self.title
            .read()
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    pub(crate) fn set_title(&self, title: &str) {
        *self.title.write() = Some(title.to_owned());
    }

    /// In-flight status of `name`, if this transaction targets it.
    pub fn affected_add_on(&self, name: &str) -> Option<AffectedAddOn> {
        (self.name == name).then(|| AffectedAddOn {
            name: self.name.clone(),
            title: self.title(),
            operation: self.operation,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// Unit of work holding the scheduler slot.
pub struct Transaction {
    info: Arc<TransactionInfo>,
    collaborators: Collaborators,
    scheduler: Arc<TransactionScheduler>,
    settings: TransactionSettings,
    stack: CompensationStack,
    state: TransactionState,
    opened: Instant,
}

impl Transaction {
    pub(crate) fn open(
        info: Arc<TransactionInfo>,
        collaborators: Collaborators,
        scheduler: Arc<TransactionScheduler>,
    ) -> Self {
        let settings = scheduler.settings().clone();
        Self {
            info,
            collaborators,
            scheduler,
            settings,
            stack: CompensationStack::new(),
            state: TransactionState::Open,
            opened: Instant::now(),
        }
    }

    pub fn info(&self) -> &Arc<TransactionInfo> {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn is_terminated(&self) -> bool {
        self.state != TransactionState::Open
    }

    pub fn affected_add_on(&self, name: &str) -> Option<AffectedAddOn> {
        self.info.affected_add_on(name)
    }

    /// Compensations that a rollback would run now, in execution order.
    pub fn pending_compensations(&self) -> Vec<Compensation> {
        self.stack.pending().cloned().collect()
    }

    /// Install a new add-on.
    pub fn create_add_on_routine(&mut self, request: &InstallRequest) -> Result<()> {
        self.ensure_routine(Operation::Installing, &request.name)?;
        match self.collaborators.catalogue.get_add_on(&request.name) {
            Ok(_) => return Err(ValidationError::AlreadyInstalled(request.name.clone()).into()),
            Err(err) if err.is_not_found() => {}
            Err(source) => {
                return Err(LifecycleError::Step {
                    step: Step::LookupAddOn,
                    source,
                })
            }
        }
        self.install(request)
    }

    /// Replace the installed add-on with the requested version.
    ///
    /// Downgrades are refused before any collaborator is mutated.
    pub fn replace_add_on_routine(&mut self, request: &InstallRequest) -> Result<()> {
        self.ensure_routine(Operation::Updating, &request.name)?;
        let entry = self.lookup_installed(&request.name)?;
        let kind = ensure_upgrade(entry.version(), &request.version)?;
        info!(
            add_on = %request.name,
            from = %entry.version(),
            to = %request.version,
            ?kind,
            "replacing add-on"
        );
        self.info.set_title(&entry.package.manifest.title);
        self.uninstall(&entry)?;
        self.install(request)
    }

    /// Remove the installed add-on.
    pub fn delete_add_on_routine(&mut self, name: &str) -> Result<()> {
        self.ensure_routine(Operation::Deleting, name)?;
        let entry = self.lookup_installed(name)?;
        self.info.set_title(&entry.package.manifest.title);
        self.uninstall(&entry)
    }

    /// Keep every effect. Does nothing once terminated.
    pub fn commit(&mut self) {
        if self.is_terminated() {
            return;
        }
        let discarded = self.stack.discard();
        self.state = TransactionState::Committed;
        self.finish("committed");
        info!(
            transaction_id = %self.info.id,
            add_on = %self.info.name,
            operation = %self.info.operation,
            discarded,
            "transaction committed"
        );
    }

    /// Undo every recorded step, newest first. Does nothing once terminated.
    pub fn rollback(&mut self) -> RollbackReport {
        if self.is_terminated() {
            return RollbackReport::default();
        }
        let report = self
            .stack
            .unwind(&self.collaborators, self.scheduler.metrics());
        self.state = TransactionState::RolledBack;
        if report.is_clean() {
            self.finish("rolled_back");
            info!(
                transaction_id = %self.info.id,
                add_on = %self.info.name,
                operation = %self.info.operation,
                applied = report.applied.len(),
                "transaction rolled back"
            );
        } else {
            self.finish("rollback_incomplete");
            error!(
                transaction_id = %self.info.id,
                add_on = %self.info.name,
                operation = %self.info.operation,
                applied = report.applied.len(),
                failed = report.failed.len(),
                "transaction rolled back with failed compensations"
            );
        }
        report
    }

    /// Run `routine`, committing on success and rolling back on failure.
    pub fn execute<T, F>(mut self, routine: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let span = info_span!(
            "transaction",
            transaction_id = %self.info.id,
            add_on = %self.info.name,
            operation = %self.info.operation
        );
        let _entered = span.enter();
        match routine(&mut self) {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "routine failed; rolling back");
                self.rollback();
                Err(err)
            }
        }
    }

    fn finish(&self, outcome: &str) {
        if let Some(metrics) = self.scheduler.metrics() {
            metrics.record_transaction(
                self.info.operation.as_str(),
                outcome,
                self.opened.elapsed().as_secs_f64(),
            );
        }
        self.scheduler.release(self.info.id);
    }

    fn ensure_routine(&self, operation: Operation, name: &str) -> Result<()> {
        if self.is_terminated() {
            return Err(ValidationError::TransactionClosed(self.info.id).into());
        }
        if operation != self.info.operation || name != self.info.name {
            return Err(ValidationError::OperationMismatch {
                expected: self.info.name.clone(),
                expected_operation: self.info.operation,
                requested: name.to_owned(),
                requested_operation: operation,
            }
            .into());
        }
        Ok(())
    }

    fn lookup_installed(&self, name: &str) -> Result<CatalogueEntry> {
        match self.collaborators.catalogue.get_add_on(name) {
            Ok(entry) => Ok(entry),
            Err(err) if err.is_not_found() => {
                Err(ValidationError::NotInstalled(name.to_owned()).into())
            }
            Err(source) => Err(LifecycleError::Step {
                step: Step::LookupAddOn,
                source,
            }),
        }
    }

    fn install(&mut self, request: &InstallRequest) -> Result<()> {
        let name = request.name.as_str();
        let collaborators = self.collaborators.clone();

        let package = collaborators
            .catalogue
            .pull_add_on(name, &request.version)
            .step(Step::PullAddOn)?;
        self.stack.push(Compensation::DeleteCatalogueEntry {
            name: name.to_owned(),
        });
        self.info.set_title(&package.manifest.title);
        let options = self.stack_options(&package, request)?;

        for image in &package.images {
            debug!(add_on = %name, image = %image.reference, "importing image");
            let mut archive: &[u8] = &image.data;
            collaborators
                .stacks
                .import_docker_image(&mut archive)
                .step(Step::ImportImage)?;
            self.stack.push(Compensation::DeleteImages {
                references: vec![image.reference.clone()],
            });
        }

        collaborators
            .stacks
            .create_stack_with_docker_compose(name, &package.compose, &options)
            .step(Step::CreateStack)?;
        if self.settings.prune_volumes_on_failure {
            self.stack.push(Compensation::RemoveVolumes {
                name: name.to_owned(),
            });
        }
        self.stack.push(Compensation::DeleteStack {
            name: name.to_owned(),
        });

        let permission = IamPermission::for_manifest(&package.manifest);
        collaborators
            .iam
            .create(&permission)
            .step(Step::WritePermission)?;
        self.stack
            .push(Compensation::DeletePermission { id: permission.id });

        for route in &package.manifest.routes {
            let file = collaborators.proxy.layout(name, route);
            collaborators
                .proxy
                .write(&file.path, &file.content)
                .step(Step::WriteRoute)?;
            self.stack.push(Compensation::DeleteFile {
                path: file.path.clone(),
            });
            collaborators
                .proxy
                .create_symbolic_link(&file.path, &file.link)
                .step(Step::LinkRoute)?;
            self.stack
                .push(Compensation::RemoveSymlink { link: file.link });
        }

        info!(add_on = %name, version = %request.version, "add-on installed");
        Ok(())
    }

    fn uninstall(&mut self, entry: &CatalogueEntry) -> Result<()> {
        let package = &entry.package;
        let manifest = &package.manifest;
        let name = manifest.name.as_str();
        let collaborators = self.collaborators.clone();

        let options = self.running_options(manifest)?;

        for route in &manifest.routes {
            let file = collaborators.proxy.layout(name, route);
            collaborators
                .proxy
                .remove_symbolic_link(&file.link)
                .step(Step::UnlinkRoute)?;
            self.stack.push(Compensation::CreateSymlink {
                target: file.path.clone(),
                link: file.link.clone(),
            });
            collaborators
                .proxy
                .delete(&file.path)
                .step(Step::DeleteRoute)?;
            self.stack.push(Compensation::WriteFile {
                path: file.path,
                content: file.content,
            });
        }

        let permission = IamPermission::for_manifest(manifest);
        collaborators
            .iam
            .delete(&permission.id)
            .step(Step::DeletePermission)?;
        self.stack
            .push(Compensation::CreatePermission { permission });

        collaborators
            .stacks
            .delete_add_on_stack(name)
            .step(Step::DeleteStack)?;
        self.stack.push(Compensation::CreateStack {
            name: name.to_owned(),
            compose: package.compose.clone(),
            options,
        });

        // Pruned volumes cannot be restored.
        collaborators
            .stacks
            .remove_unused_volumes(name)
            .step(Step::RemoveVolumes)?;

        let references = package.image_references();
        if !references.is_empty() {
            collaborators
                .stacks
                .delete_docker_images(&references)
                .step(Step::DeleteImages)?;
            self.stack.push(Compensation::ImportImages {
                images: package.images.clone(),
            });
        }

        collaborators
            .catalogue
            .delete_add_on(name)
            .step(Step::DeleteCatalogueEntry)?;
        self.stack.push(Compensation::RestoreCatalogueEntry {
            name: name.to_owned(),
            version: manifest.version.clone(),
        });

        info!(add_on = %name, version = %manifest.version, "add-on removed");
        Ok(())
    }

    /// Resolve the options a stack is created with from the package and request.
    fn stack_options(&self, package: &AddOnPackage, request: &InstallRequest) -> Result<StackOptions> {
        let manifest = &package.manifest;
        if manifest.name != request.name {
            return Err(ValidationError::InvalidManifest {
                name: request.name.clone(),
                reason: format!("package declares name {}", manifest.name),
            }
            .into());
        }
        if manifest.version != request.version {
            return Err(ValidationError::InvalidManifest {
                name: request.name.clone(),
                reason: format!(
                    "package version {} does not match requested {}",
                    manifest.version, request.version
                ),
            }
            .into());
        }
        if !manifest.supports_platform(&self.settings.platform) {
            return Err(ValidationError::UnsupportedPlatform {
                name: request.name.clone(),
                platform: self.settings.platform.clone(),
            }
            .into());
        }
        let violations = self.collaborators.validator.validate(manifest);
        if !violations.is_empty() {
            return Err(ValidationError::InvalidManifest {
                name: request.name.clone(),
                reason: violations.join("; "),
            }
            .into());
        }
        if let Some(key) = request
            .settings
            .keys()
            .find(|key| !manifest.declares_setting(key))
        {
            return Err(ValidationError::UnknownSetting {
                name: request.name.clone(),
                key: key.clone(),
            }
            .into());
        }

        let mut settings = IndexMap::new();
        for spec in &manifest.settings {
            match request.settings.get(&spec.key).or(spec.default.as_ref()) {
                Some(value) => {
                    settings.insert(spec.key.clone(), value.clone());
                }
                None if spec.required => {
                    return Err(ValidationError::MissingSetting {
                        name: request.name.clone(),
                        key: spec.key.clone(),
                    }
                    .into())
                }
                None => {}
            }
        }
        Ok(StackOptions {
            platform: self.settings.platform.clone(),
            settings,
        })
    }

    /// Options reproducing the running stack, read from its containers' environment.
    fn running_options(&self, manifest: &AddOnManifest) -> Result<StackOptions> {
        let stacks = &self.collaborators.stacks;
        let containers = stacks
            .list_all_stack_containers(&manifest.name)
            .step(Step::InspectStack)?;
        let mut settings = IndexMap::new();
        for container in containers {
            let details = stacks
                .inspect_container(&container.id)
                .step(Step::InspectStack)?;
            for (key, value) in details.env {
                if manifest.declares_setting(&key) {
                    settings.entry(key).or_insert(value);
                }
            }
        }
        Ok(StackOptions {
            platform: self.settings.platform.clone(),
            settings,
        })
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_terminated() {
            warn!(
                transaction_id = %self.info.id,
                add_on = %self.info.name,
                "transaction dropped while open; rolling back"
            );
            self.rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("pending", &self.stack.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_falls_back_to_name() {
        let info = TransactionInfo::new("grafana", Operation::Installing);
        assert_eq!(info.title(), "grafana");
        info.set_title("Grafana");
        assert_eq!(info.title(), "Grafana");
    }

    #[test]
    fn projection_only_matches_the_target() {
        let info = TransactionInfo::new("grafana", Operation::Updating);
        assert!(info.affected_add_on("node-red").is_none());
        let affected = info.affected_add_on("grafana").unwrap();
        assert_eq!(affected.operation, Operation::Updating);
        assert_eq!(affected.title, "grafana");
    }

    #[test]
    fn settings_follow_lifecycle_config() {
        let config = LifecycleConfig {
            platform: "linux/amd64".into(),
            prune_volumes_on_failure: false,
            ..LifecycleConfig::default()
        };
        let settings = TransactionSettings::from(&config);
        assert_eq!(settings.platform, "linux/amd64");
        assert!(!settings.prune_volumes_on_failure);
    }
}
