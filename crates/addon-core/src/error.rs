//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use addon_versioning::VersionError;
use thiserror::Error;

use crate::transaction::Operation;

/// Result alias used throughout the lifecycle engine.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Error type for lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Another lifecycle transaction currently holds the scheduler slot.
    #[error("{operation} of add-on {add_on} is already in progress")]
    Busy {
        /// Add-on targeted by the open transaction.
        add_on: String,
        /// Operation the open transaction performs.
        operation: Operation,
    },
    /// The request was rejected before or during the routine without a collaborator failing.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A collaborator failed while executing a routine step.
    #[error("{step} error: {source}")]
    Step {
        /// Step that was being executed.
        step: Step,
        /// Underlying collaborator failure.
        #[source]
        source: CollaboratorError,
    },
    /// The blocking task executing the operation panicked or was cancelled.
    #[error("lifecycle operation interrupted: {0}")]
    Interrupted(String),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<tokio::task::JoinError> for LifecycleError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Interrupted(err.to_string())
    }
}

impl From<VersionError> for LifecycleError {
    fn from(err: VersionError) -> Self {
        Self::Validation(ValidationError::Version(err))
    }
}

/// Reasons a lifecycle request is refused.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Version parsing or upgrade policy violation.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// The add-on is not present in the catalogue.
    #[error("add-on {0} is not installed")]
    NotInstalled(String),
    /// The add-on is already present in the catalogue.
    #[error("add-on {0} is already installed")]
    AlreadyInstalled(String),
    /// The package does not list the device platform.
    #[error("add-on {name} does not support platform {platform}")]
    UnsupportedPlatform {
        /// Add-on name.
        name: String,
        /// Device platform.
        platform: String,
    },
    /// The manifest was rejected by the validator or does not match the request.
    #[error("invalid manifest for add-on {name}: {reason}")]
    InvalidManifest {
        /// Add-on name.
        name: String,
        /// Human readable reason.
        reason: String,
    },
    /// A required setting was neither supplied nor defaulted.
    #[error("add-on {name} requires setting {key}")]
    MissingSetting {
        /// Add-on name.
        name: String,
        /// Setting key.
        key: String,
    },
    /// A supplied setting is not declared by the manifest.
    #[error("add-on {name} does not declare setting {key}")]
    UnknownSetting {
        /// Add-on name.
        name: String,
        /// Setting key.
        key: String,
    },
    /// A routine was invoked for a different add-on or operation than the transaction was opened for.
    #[error("transaction opened for {expected_operation} of {expected} cannot run {requested_operation} of {requested}")]
    OperationMismatch {
        /// Add-on the transaction was opened for.
        expected: String,
        /// Operation the transaction was opened for.
        expected_operation: Operation,
        /// Add-on the routine was called with.
        requested: String,
        /// Operation the routine performs.
        requested_operation: Operation,
    },
    /// The transaction was already committed or rolled back.
    #[error("transaction {0} is already terminated")]
    TransactionClosed(uuid::Uuid),
}

/// Error reported by a collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The requested object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object category, e.g. `add-on` or `container`.
        kind: &'static str,
        /// Object identifier.
        name: String,
    },
    /// Wrapper for IO errors raised by file or socket backed collaborators.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Convenience constructor for [`CollaboratorError::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Convenience constructor for [`CollaboratorError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this error signals a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Routine step a collaborator failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Reading the installed catalogue entry.
    LookupAddOn,
    /// Downloading the package into the catalogue.
    PullAddOn,
    /// Importing a container image archive.
    ImportImage,
    /// Creating the compose stack.
    CreateStack,
    /// Writing the IAM permission.
    WritePermission,
    /// Writing a reverse-proxy route file.
    WriteRoute,
    /// Enabling a reverse-proxy route.
    LinkRoute,
    /// Reading the containers of a running stack.
    InspectStack,
    /// Disabling a reverse-proxy route.
    UnlinkRoute,
    /// Deleting a reverse-proxy route file.
    DeleteRoute,
    /// Deleting the IAM permission.
    DeletePermission,
    /// Deleting the compose stack.
    DeleteStack,
    /// Pruning volumes left by the stack.
    RemoveVolumes,
    /// Deleting container images.
    DeleteImages,
    /// Deleting the catalogue entry.
    DeleteCatalogueEntry,
}

impl Step {
    /// Human readable label used in error messages.
    pub fn label(self) -> &'static str {
        match self {
            Step::LookupAddOn => "catalogue lookup",
            Step::PullAddOn => "catalogue pull",
            Step::ImportImage => "docker image import",
            Step::CreateStack => "docker stack",
            Step::WritePermission => "IAM permission",
            Step::WriteRoute => "NGINX route",
            Step::LinkRoute => "NGINX symlink",
            Step::InspectStack => "docker stack inspection",
            Step::UnlinkRoute => "NGINX symlink removal",
            Step::DeleteRoute => "NGINX route removal",
            Step::DeletePermission => "IAM permission removal",
            Step::DeleteStack => "docker stack removal",
            Step::RemoveVolumes => "docker volume cleanup",
            Step::DeleteImages => "docker image removal",
            Step::DeleteCatalogueEntry => "catalogue removal",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Attribute a collaborator failure to a routine step.
pub(crate) trait StepExt<T> {
    fn step(self, step: Step) -> Result<T>;
}

impl<T> StepExt<T> for std::result::Result<T, CollaboratorError> {
    fn step(self, step: Step) -> Result<T> {
        self.map_err(|source| LifecycleError::Step { step, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_name_the_step() {
        let err = Err::<(), _>(CollaboratorError::failed("permission denied"))
            .step(Step::WriteRoute)
            .unwrap_err();
        assert_eq!(err.to_string(), "NGINX route error: permission denied");
    }

    #[test]
    fn busy_names_the_open_transaction() {
        let err = LifecycleError::Busy {
            add_on: "grafana".into(),
            operation: Operation::Updating,
        };
        assert_eq!(
            err.to_string(),
            "updating of add-on grafana is already in progress"
        );
    }

    #[test]
    fn version_errors_are_validation_errors() {
        let err: LifecycleError = addon_versioning::AddOnVersion::parse("")
            .unwrap_err()
            .into();
        assert!(matches!(
            err,
            LifecycleError::Validation(ValidationError::Version(VersionError::Empty))
        ));
    }
}
