//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory lifecycle collaborators for tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use addon_core::{
    AddOnManifest, AddOnPackage, Catalogue, CatalogueEntry, CollaboratorError, CollaboratorResult,
    Collaborators, ContainerDetails, ContainerState, ContainerSummary, IamPermission,
    IamPermissionWriter, PublishedRoute, ReverseProxy, RouteFile, StackOptions, StackService,
    Validator,
};
use addon_versioning::AddOnVersion;
use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::debug;

/// Directory holding route files.
pub const ROUTES_AVAILABLE: &str = "/etc/nginx/addons-available";
/// Directory holding enabled-route symlinks.
pub const ROUTES_ENABLED: &str = "/etc/nginx/addons-enabled";

/// Mutating collaborator call, recorded in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    PullAddOn { name: String, version: String },
    DeleteAddOn { name: String },
    ImportImage { reference: String },
    DeleteImages { references: Vec<String> },
    CreateStack { name: String, settings: IndexMap<String, String> },
    DeleteStack { name: String },
    RemoveVolumes { name: String },
    CreatePermission { id: String },
    DeletePermission { id: String },
    WriteFile { path: PathBuf },
    DeleteFile { path: PathBuf },
    CreateSymlink { link: PathBuf },
    RemoveSymlink { link: PathBuf },
}

/// Observable device state. Equality ignores insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub catalogue: IndexMap<String, AddOnVersion>,
    pub images: IndexSet<String>,
    pub stacks: IndexMap<String, IndexMap<String, String>>,
    pub volumes: IndexSet<String>,
    pub permissions: IndexMap<String, IamPermission>,
    pub files: IndexMap<PathBuf, String>,
    pub links: IndexMap<PathBuf, PathBuf>,
}

type Matcher = Box<dyn Fn(&HostCall) -> bool + Send + Sync>;

struct FailureRule {
    matcher: Matcher,
    message: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    registry: Vec<AddOnPackage>,
    installed: IndexMap<String, CatalogueEntry>,
    containers: IndexMap<String, Vec<(ContainerSummary, IndexMap<String, String>)>>,
    state: HostState,
    journal: Vec<HostCall>,
    rules: Vec<FailureRule>,
    violations: Vec<String>,
    latency: Duration,
}

/// In-memory device implementing every collaborator contract.
///
/// Each mutating call is journaled before it is applied, so failed attempts
/// show up in [`RecordingHost::journal`] too. A call matching a failure rule
/// has no effect.
#[derive(Default)]
pub struct RecordingHost {
    inner: Mutex<Inner>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::from_host(self.clone())
    }

    /// Make `package` available for download.
    pub fn publish(&self, package: AddOnPackage) {
        self.inner.lock().registry.push(package);
    }

    /// Put the device in the state a committed install of `package` leaves behind.
    pub fn seed_installed(&self, package: AddOnPackage, settings: IndexMap<String, String>) {
        let mut inner = self.inner.lock();
        let name = package.manifest.name.clone();
        inner
            .state
            .catalogue
            .insert(name.clone(), package.manifest.version.clone());
        for reference in package.image_references() {
            inner.state.images.insert(reference);
        }
        inner.state.stacks.insert(name.clone(), settings.clone());
        inner.state.volumes.insert(volume_name(&name));
        inner
            .containers
            .insert(name.clone(), vec![running_container(&name, settings)]);
        let permission = IamPermission::for_manifest(&package.manifest);
        inner
            .state
            .permissions
            .insert(permission.id.clone(), permission);
        for route in &package.manifest.routes {
            let file = route_file(&name, route);
            inner.state.files.insert(file.path.clone(), file.content);
            inner.state.links.insert(file.link, file.path);
        }
        if !inner.registry.contains(&package) {
            inner.registry.push(package.clone());
        }
        inner.installed.insert(
            name,
            CatalogueEntry {
                package,
                installed_at: Utc::now(),
            },
        );
    }

    /// Fail every call matching `matcher` with `message`.
    pub fn fail_on<F>(&self, matcher: F, message: impl Into<String>)
    where
        F: Fn(&HostCall) -> bool + Send + Sync + 'static,
    {
        self.push_rule(Box::new(matcher), message.into(), None);
    }

    /// Fail only the next call matching `matcher`.
    pub fn fail_once<F>(&self, matcher: F, message: impl Into<String>)
    where
        F: Fn(&HostCall) -> bool + Send + Sync + 'static,
    {
        self.push_rule(Box::new(matcher), message.into(), Some(1));
    }

    /// Make the validator report `violation` for every manifest.
    pub fn reject_manifests(&self, violation: impl Into<String>) {
        self.inner.lock().violations.push(violation.into());
    }

    /// Sleep this long inside every mutating call.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Override the state of every container of `name`.
    pub fn set_container_state(&self, name: &str, state: ContainerState, exit_code: Option<i64>) {
        if let Some(containers) = self.inner.lock().containers.get_mut(name) {
            for (summary, _) in containers.iter_mut() {
                summary.state = state;
                summary.exit_code = exit_code;
            }
        }
    }

    pub fn journal(&self) -> Vec<HostCall> {
        self.inner.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.inner.lock().journal.clear();
    }

    pub fn state(&self) -> HostState {
        self.inner.lock().state.clone()
    }

    fn push_rule(&self, matcher: Matcher, message: String, remaining: Option<usize>) {
        self.inner.lock().rules.push(FailureRule {
            matcher,
            message,
            remaining,
        });
    }

    /// Journal `call`, then run `apply` unless a failure rule matches.
    fn mutate<T>(
        &self,
        call: HostCall,
        apply: impl FnOnce(&mut Inner) -> CollaboratorResult<T>,
    ) -> CollaboratorResult<T> {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut inner = self.inner.lock();
        debug!(?call, "host call");
        inner.journal.push(call.clone());
        let mut injected = None;
        for rule in inner.rules.iter_mut() {
            if rule.remaining == Some(0) || !(rule.matcher)(&call) {
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            injected = Some(rule.message.clone());
            break;
        }
        match injected {
            Some(message) => Err(CollaboratorError::failed(message)),
            None => apply(&mut *inner),
        }
    }
}

impl Catalogue for RecordingHost {
    fn get_add_on(&self, name: &str) -> CollaboratorResult<CatalogueEntry> {
        self.inner
            .lock()
            .installed
            .get(name)
            .cloned()
            .ok_or_else(|| CollaboratorError::not_found("add-on", name))
    }

    fn list_add_ons(&self) -> CollaboratorResult<Vec<CatalogueEntry>> {
        Ok(self.inner.lock().installed.values().cloned().collect())
    }

    fn pull_add_on(&self, name: &str, version: &AddOnVersion) -> CollaboratorResult<AddOnPackage> {
        let call = HostCall::PullAddOn {
            name: name.to_owned(),
            version: version.to_string(),
        };
        self.mutate(call, |inner| {
            let package = inner
                .registry
                .iter()
                .find(|package| {
                    package.manifest.name == name && &package.manifest.version == version
                })
                .cloned()
                .ok_or_else(|| CollaboratorError::not_found("package", format!("{name}@{version}")))?;
            inner
                .state
                .catalogue
                .insert(name.to_owned(), version.clone());
            inner.installed.insert(
                name.to_owned(),
                CatalogueEntry {
                    package: package.clone(),
                    installed_at: Utc::now(),
                },
            );
            Ok(package)
        })
    }

    fn delete_add_on(&self, name: &str) -> CollaboratorResult<()> {
        let call = HostCall::DeleteAddOn {
            name: name.to_owned(),
        };
        self.mutate(call, |inner| {
            inner
                .installed
                .shift_remove(name)
                .ok_or_else(|| CollaboratorError::not_found("add-on", name))?;
            inner.state.catalogue.shift_remove(name);
            Ok(())
        })
    }
}

impl StackService for RecordingHost {
    fn create_stack_with_docker_compose(
        &self,
        name: &str,
        _compose: &str,
        options: &StackOptions,
    ) -> CollaboratorResult<()> {
        let call = HostCall::CreateStack {
            name: name.to_owned(),
            settings: options.settings.clone(),
        };
        self.mutate(call, |inner| {
            if inner.state.stacks.contains_key(name) {
                return Err(CollaboratorError::failed(format!("stack {name} already exists")));
            }
            inner
                .state
                .stacks
                .insert(name.to_owned(), options.settings.clone());
            inner.state.volumes.insert(volume_name(name));
            inner.containers.insert(
                name.to_owned(),
                vec![running_container(name, options.settings.clone())],
            );
            Ok(())
        })
    }

    fn delete_add_on_stack(&self, name: &str) -> CollaboratorResult<()> {
        let call = HostCall::DeleteStack {
            name: name.to_owned(),
        };
        self.mutate(call, |inner| {
            inner
                .state
                .stacks
                .shift_remove(name)
                .ok_or_else(|| CollaboratorError::not_found("stack", name))?;
            inner.containers.shift_remove(name);
            Ok(())
        })
    }

    fn import_docker_image(&self, archive: &mut dyn Read) -> CollaboratorResult<()> {
        let mut reference = String::new();
        archive.read_to_string(&mut reference)?;
        let call = HostCall::ImportImage {
            reference: reference.clone(),
        };
        self.mutate(call, |inner| {
            inner.state.images.insert(reference);
            Ok(())
        })
    }

    fn delete_docker_images(&self, references: &[String]) -> CollaboratorResult<()> {
        let call = HostCall::DeleteImages {
            references: references.to_vec(),
        };
        self.mutate(call, |inner| {
            for reference in references {
                inner.state.images.shift_remove(reference);
            }
            Ok(())
        })
    }

    fn remove_unused_volumes(&self, name: &str) -> CollaboratorResult<()> {
        let call = HostCall::RemoveVolumes {
            name: name.to_owned(),
        };
        self.mutate(call, |inner| {
            if !inner.state.stacks.contains_key(name) {
                inner.state.volumes.shift_remove(&volume_name(name));
            }
            Ok(())
        })
    }

    fn list_all_stack_containers(&self, name: &str) -> CollaboratorResult<Vec<ContainerSummary>> {
        Ok(self
            .inner
            .lock()
            .containers
            .get(name)
            .map(|containers| containers.iter().map(|(summary, _)| summary.clone()).collect())
            .unwrap_or_default())
    }

    fn inspect_container(&self, id: &str) -> CollaboratorResult<ContainerDetails> {
        self.inner
            .lock()
            .containers
            .values()
            .flatten()
            .find(|(summary, _)| summary.id == id)
            .map(|(summary, env)| ContainerDetails {
                id: summary.id.clone(),
                state: summary.state,
                env: env.clone(),
            })
            .ok_or_else(|| CollaboratorError::not_found("container", id))
    }
}

impl ReverseProxy for RecordingHost {
    fn layout(&self, add_on: &str, route: &PublishedRoute) -> RouteFile {
        route_file(add_on, route)
    }

    fn write(&self, path: &Path, content: &str) -> CollaboratorResult<()> {
        let call = HostCall::WriteFile {
            path: path.to_path_buf(),
        };
        self.mutate(call, |inner| {
            inner
                .state
                .files
                .insert(path.to_path_buf(), content.to_owned());
            Ok(())
        })
    }

    fn delete(&self, path: &Path) -> CollaboratorResult<()> {
        let call = HostCall::DeleteFile {
            path: path.to_path_buf(),
        };
        self.mutate(call, |inner| {
            inner
                .state
                .files
                .shift_remove(path)
                .map(|_| ())
                .ok_or_else(|| CollaboratorError::not_found("file", path.display().to_string()))
        })
    }

    fn create_symbolic_link(&self, target: &Path, link: &Path) -> CollaboratorResult<()> {
        let call = HostCall::CreateSymlink {
            link: link.to_path_buf(),
        };
        self.mutate(call, |inner| {
            if !inner.state.files.contains_key(target) {
                return Err(CollaboratorError::failed(format!(
                    "link target {} does not exist",
                    target.display()
                )));
            }
            inner
                .state
                .links
                .insert(link.to_path_buf(), target.to_path_buf());
            Ok(())
        })
    }

    fn remove_symbolic_link(&self, link: &Path) -> CollaboratorResult<()> {
        let call = HostCall::RemoveSymlink {
            link: link.to_path_buf(),
        };
        self.mutate(call, |inner| {
            inner
                .state
                .links
                .shift_remove(link)
                .map(|_| ())
                .ok_or_else(|| CollaboratorError::not_found("symlink", link.display().to_string()))
        })
    }
}

impl IamPermissionWriter for RecordingHost {
    fn create(&self, permission: &IamPermission) -> CollaboratorResult<()> {
        let call = HostCall::CreatePermission {
            id: permission.id.clone(),
        };
        self.mutate(call, |inner| {
            inner
                .state
                .permissions
                .insert(permission.id.clone(), permission.clone());
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> CollaboratorResult<()> {
        let call = HostCall::DeletePermission { id: id.to_owned() };
        self.mutate(call, |inner| {
            inner
                .state
                .permissions
                .shift_remove(id)
                .map(|_| ())
                .ok_or_else(|| CollaboratorError::not_found("permission", id))
        })
    }
}

impl Validator for RecordingHost {
    fn validate(&self, _manifest: &AddOnManifest) -> Vec<String> {
        self.inner.lock().violations.clone()
    }
}

/// Route file layout used by the host.
pub fn route_file(add_on: &str, route: &PublishedRoute) -> RouteFile {
    let file_name = format!("{add_on}-{}.conf", route.id);
    RouteFile {
        path: Path::new(ROUTES_AVAILABLE).join(&file_name),
        link: Path::new(ROUTES_ENABLED).join(&file_name),
        content: format!(
            "location {} {{\n    proxy_pass http://127.0.0.1:{};\n}}\n",
            route.path, route.port
        ),
    }
}

fn volume_name(stack: &str) -> String {
    format!("{stack}_data")
}

fn running_container(
    stack: &str,
    env: IndexMap<String, String>,
) -> (ContainerSummary, IndexMap<String, String>) {
    let id = format!("{stack}-app-1");
    (
        ContainerSummary {
            id: id.clone(),
            name: id,
            state: ContainerState::Running,
            exit_code: None,
        },
        env,
    )
}
