//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Transactional install, update and removal of device add-ons.
//!
//! Every mutation runs inside a [`Transaction`] granted by the single-writer
//! [`TransactionScheduler`]. Each completed step records a [`Compensation`];
//! failures unwind them newest first so the device is left as it was.

pub mod bootstrap;
pub mod collaborators;
pub mod compensation;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod metrics;
pub mod scheduler;
pub mod status;
pub mod transaction;

pub use bootstrap::bootstrap;
pub use collaborators::{
    AddOnManifest, AddOnPackage, Catalogue, CatalogueEntry, CollaboratorResult, Collaborators,
    ContainerDetails, ContainerState, ContainerSummary, IamPermission, IamPermissionWriter,
    ImageArchive, PublishedRoute, ReverseProxy, RouteFile, SettingSpec, StackOptions,
    StackService, Validator,
};
pub use compensation::{
    Compensation, CompensationKind, CompensationStack, FailedCompensation, RollbackReport,
};
pub use error::{CollaboratorError, LifecycleError, Result, Step, ValidationError};
pub use heartbeat::{
    apply_operation_with_heartbeat, silent_heartbeat, HeartbeatExecutor, MIN_HEARTBEAT_INTERVAL,
};
pub use lifecycle::LifecycleService;
pub use metrics::TransactionMetrics;
pub use scheduler::TransactionScheduler;
pub use status::{AddOnStatus, AddOnView, AffectedAddOn, StatusResolver};
pub use transaction::{
    InstallRequest, Operation, Transaction, TransactionInfo, TransactionSettings,
};
