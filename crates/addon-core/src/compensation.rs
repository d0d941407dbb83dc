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
use std::path::PathBuf;

use addon_versioning::AddOnVersion;
use tracing::{debug, error};

use crate::collaborators::{
    CollaboratorResult, Collaborators, IamPermission, ImageArchive, StackOptions,
};
use crate::metrics::TransactionMetrics;

/// Action undoing one completed routine step.
///
/// Compensations are plain values so a stack can be inspected, logged and
/// replayed without closures capturing collaborator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteCatalogueEntry { name: String },
    RestoreCatalogueEntry { name: String, version: AddOnVersion },
    DeleteImages { references: Vec<String> },
    ImportImages { images: Vec<ImageArchive> },
    DeleteStack { name: String },
    CreateStack {
        name: String,
        compose: String,
        options: StackOptions,
    },
    RemoveVolumes { name: String },
    DeletePermission { id: String },
    CreatePermission { permission: IamPermission },
    DeleteFile { path: PathBuf },
    WriteFile { path: PathBuf, content: String },
    RemoveSymlink { link: PathBuf },
    CreateSymlink { target: PathBuf, link: PathBuf },
}

/// Discriminant of a [`Compensation`], used for metrics labels and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensationKind {
    DeleteCatalogueEntry,
    RestoreCatalogueEntry,
    DeleteImages,
    ImportImages,
    DeleteStack,
    CreateStack,
    RemoveVolumes,
    DeletePermission,
    CreatePermission,
    DeleteFile,
    WriteFile,
    RemoveSymlink,
    CreateSymlink,
}

impl CompensationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CompensationKind::DeleteCatalogueEntry => "delete_catalogue_entry",
            CompensationKind::RestoreCatalogueEntry => "restore_catalogue_entry",
            CompensationKind::DeleteImages => "delete_images",
            CompensationKind::ImportImages => "import_images",
            CompensationKind::DeleteStack => "delete_stack",
            CompensationKind::CreateStack => "create_stack",
            CompensationKind::RemoveVolumes => "remove_volumes",
            CompensationKind::DeletePermission => "delete_permission",
            CompensationKind::CreatePermission => "create_permission",
            CompensationKind::DeleteFile => "delete_file",
            CompensationKind::WriteFile => "write_file",
            CompensationKind::RemoveSymlink => "remove_symlink",
            CompensationKind::CreateSymlink => "create_symlink",
        }
    }
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Compensation {
    pub fn kind(&self) -> CompensationKind {
        match self {
            Compensation::DeleteCatalogueEntry { .. } => CompensationKind::DeleteCatalogueEntry,
            Compensation::RestoreCatalogueEntry { .. } => CompensationKind::RestoreCatalogueEntry,
            Compensation::DeleteImages { .. } => CompensationKind::DeleteImages,
            Compensation::ImportImages { .. } => CompensationKind::ImportImages,
            Compensation::DeleteStack { .. } => CompensationKind::DeleteStack,
            Compensation::CreateStack { .. } => CompensationKind::CreateStack,
            Compensation::RemoveVolumes { .. } => CompensationKind::RemoveVolumes,
            Compensation::DeletePermission { .. } => CompensationKind::DeletePermission,
            Compensation::CreatePermission { .. } => CompensationKind::CreatePermission,
            Compensation::DeleteFile { .. } => CompensationKind::DeleteFile,
            Compensation::WriteFile { .. } => CompensationKind::WriteFile,
            Compensation::RemoveSymlink { .. } => CompensationKind::RemoveSymlink,
            Compensation::CreateSymlink { .. } => CompensationKind::CreateSymlink,
        }
    }

    /// Execute the action against the collaborators.
    pub fn apply(&self, collaborators: &Collaborators) -> CollaboratorResult<()> {
        match self {
            Compensation::DeleteCatalogueEntry { name } => {
                collaborators.catalogue.delete_add_on(name)
            }
            Compensation::RestoreCatalogueEntry { name, version } => collaborators
                .catalogue
                .pull_add_on(name, version)
                .map(|_| ()),
            Compensation::DeleteImages { references } => {
                collaborators.stacks.delete_docker_images(references)
            }
            Compensation::ImportImages { images } => {
                for image in images {
                    let mut reader: &[u8] = &image.data;
                    collaborators.stacks.import_docker_image(&mut reader)?;
                }
                Ok(())
            }
            Compensation::DeleteStack { name } => collaborators.stacks.delete_add_on_stack(name),
            Compensation::CreateStack {
                name,
                compose,
                options,
            } => collaborators
                .stacks
                .create_stack_with_docker_compose(name, compose, options),
            Compensation::RemoveVolumes { name } => {
                collaborators.stacks.remove_unused_volumes(name)
            }
            Compensation::DeletePermission { id } => collaborators.iam.delete(id),
            Compensation::CreatePermission { permission } => collaborators.iam.create(permission),
            Compensation::DeleteFile { path } => collaborators.proxy.delete(path),
            Compensation::WriteFile { path, content } => collaborators.proxy.write(path, content),
            Compensation::RemoveSymlink { link } => collaborators.proxy.remove_symbolic_link(link),
            Compensation::CreateSymlink { target, link } => {
                collaborators.proxy.create_symbolic_link(target, link)
            }
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteCatalogueEntry { name } => {
                write!(f, "delete catalogue entry {name}")
            }
            Compensation::RestoreCatalogueEntry { name, version } => {
                write!(f, "restore catalogue entry {name}@{version}")
            }
            Compensation::DeleteImages { references } => {
                write!(f, "delete images {}", references.join(", "))
            }
            Compensation::ImportImages { images } => write!(f, "import {} images", images.len()),
            Compensation::DeleteStack { name } => write!(f, "delete stack {name}"),
            Compensation::CreateStack { name, .. } => write!(f, "create stack {name}"),
            Compensation::RemoveVolumes { name } => write!(f, "remove unused volumes of {name}"),
            Compensation::DeletePermission { id } => write!(f, "delete permission {id}"),
            Compensation::CreatePermission { permission } => {
                write!(f, "create permission {}", permission.id)
            }
            Compensation::DeleteFile { path } => write!(f, "delete file {}", path.display()),
            Compensation::WriteFile { path, .. } => write!(f, "write file {}", path.display()),
            Compensation::RemoveSymlink { link } => write!(f, "remove symlink {}", link.display()),
            Compensation::CreateSymlink { link, .. } => {
                write!(f, "create symlink {}", link.display())
            }
        }
    }
}

/// Compensation that could not be applied during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCompensation {
    pub compensation: Compensation,
    pub error: String,
}

/// Outcome of unwinding a [`CompensationStack`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Compensations that succeeded, in execution order.
    pub applied: Vec<Compensation>,
    /// Compensations that failed, in execution order.
    pub failed: Vec<FailedCompensation>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.applied.len() + self.failed.len()
    }
}

/// LIFO list of compensations accumulated by a routine.
#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, compensation: Compensation) {
        debug!(compensation = %compensation, depth = self.actions.len() + 1, "compensation recorded");
        self.actions.push(compensation);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pending compensations in the order they would run.
    pub fn pending(&self) -> impl Iterator<Item = &Compensation> {
        self.actions.iter().rev()
    }

    /// Drop every compensation without running it. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.actions.len();
        self.actions.clear();
        dropped
    }

    /// Run every compensation newest first.
    ///
    /// A failing compensation is logged and recorded in the report; the
    /// remaining ones still run. The stack is empty afterwards.
    pub fn unwind(
        &mut self,
        collaborators: &Collaborators,
        metrics: Option<&TransactionMetrics>,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some(compensation) = self.actions.pop() {
            let kind = compensation.kind();
            match compensation.apply(collaborators) {
                Ok(()) => {
                    debug!(compensation = %compensation, "compensation applied");
                    if let Some(metrics) = metrics {
                        metrics.record_compensation(kind.as_str(), true);
                    }
                    report.applied.push(compensation);
                }
                Err(err) => {
                    error!(compensation = %compensation, error = %err, "compensation failed; continuing rollback");
                    if let Some(metrics) = metrics {
                        metrics.record_compensation(kind.as_str(), false);
                    }
                    report.failed.push(FailedCompensation {
                        compensation,
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_lists_newest_first() {
        let mut stack = CompensationStack::new();
        stack.push(Compensation::DeleteCatalogueEntry {
            name: "grafana".into(),
        });
        stack.push(Compensation::DeleteStack {
            name: "grafana".into(),
        });
        let kinds: Vec<_> = stack.pending().map(Compensation::kind).collect();
        assert_eq!(
            kinds,
            vec![
                CompensationKind::DeleteStack,
                CompensationKind::DeleteCatalogueEntry
            ]
        );
    }

    #[test]
    fn discard_empties_the_stack() {
        let mut stack = CompensationStack::new();
        stack.push(Compensation::RemoveVolumes {
            name: "grafana".into(),
        });
        assert_eq!(stack.discard(), 1);
        assert!(stack.is_empty());
        assert_eq!(stack.discard(), 0);
    }

    #[test]
    fn labels_are_readable() {
        let compensation = Compensation::RemoveSymlink {
            link: PathBuf::from("/etc/nginx/addons-enabled/grafana-ui.conf"),
        };
        assert_eq!(
            compensation.to_string(),
            "remove symlink /etc/nginx/addons-enabled/grafana-ui.conf"
        );
        assert_eq!(compensation.kind().as_str(), "remove_symlink");
    }
}
