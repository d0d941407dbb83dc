//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Collaborator contracts and the data they exchange.
//!
//! Every collaborator call is synchronous and either takes full effect or
//! none. Routines run on a blocking thread, so implementations are free to
//! perform blocking IO.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addon_versioning::AddOnVersion;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Result type returned by collaborators.
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Declarative description of an add-on package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnManifest {
    pub name: String,
    pub title: String,
    pub version: AddOnVersion,
    /// Supported platforms. Empty means any platform.
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub settings: Vec<SettingSpec>,
    #[serde(default)]
    pub routes: Vec<PublishedRoute>,
}

impl AddOnManifest {
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }

    pub fn declares_setting(&self, key: &str) -> bool {
        self.settings.iter().any(|spec| spec.key == key)
    }
}

/// Setting exposed to the add-on stack as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingSpec {
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// HTTP route the add-on publishes through the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRoute {
    pub id: String,
    pub path: String,
    pub port: u16,
}

/// Container image shipped inside a package.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageArchive {
    pub reference: String,
    pub data: Bytes,
}

impl fmt::Debug for ImageArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageArchive")
            .field("reference", &self.reference)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Downloaded add-on package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOnPackage {
    pub manifest: AddOnManifest,
    /// Docker compose document used to create the stack.
    pub compose: String,
    pub images: Vec<ImageArchive>,
}

impl AddOnPackage {
    pub fn image_references(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|image| image.reference.clone())
            .collect()
    }
}

/// Installed package as recorded by the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub package: AddOnPackage,
    pub installed_at: DateTime<Utc>,
}

impl CatalogueEntry {
    pub fn name(&self) -> &str {
        &self.package.manifest.name
    }

    pub fn version(&self) -> &AddOnVersion {
        &self.package.manifest.version
    }
}

/// Location and content of a reverse-proxy route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFile {
    /// Configuration file in the available-routes directory.
    pub path: PathBuf,
    /// Symbolic link in the enabled-routes directory pointing at `path`.
    pub link: PathBuf,
    pub content: String,
}

/// IAM permission granting access to the add-on's routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamPermission {
    pub id: String,
    pub add_on: String,
    pub paths: Vec<String>,
}

impl IamPermission {
    /// Permission derived from the routes an add-on publishes.
    pub fn for_manifest(manifest: &AddOnManifest) -> Self {
        Self {
            id: format!("addon.{}", manifest.name),
            add_on: manifest.name.clone(),
            paths: manifest
                .routes
                .iter()
                .map(|route| route.path.clone())
                .collect(),
        }
    }
}

/// Parameters for creating a compose stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOptions {
    pub platform: String,
    /// Environment passed to the stack's containers.
    pub settings: IndexMap<String, String>,
}

/// Container lifecycle state as reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub state: ContainerState,
    pub env: IndexMap<String, String>,
}

/// Store of installed add-on packages.
pub trait Catalogue: Send + Sync {
    fn get_add_on(&self, name: &str) -> CollaboratorResult<CatalogueEntry>;
    fn list_add_ons(&self) -> CollaboratorResult<Vec<CatalogueEntry>>;
    /// Download `name` at `version` and record it as installed.
    fn pull_add_on(&self, name: &str, version: &AddOnVersion) -> CollaboratorResult<AddOnPackage>;
    fn delete_add_on(&self, name: &str) -> CollaboratorResult<()>;
}

/// Container runtime managing compose stacks, images and volumes.
pub trait StackService: Send + Sync {
    fn create_stack_with_docker_compose(
        &self,
        name: &str,
        compose: &str,
        options: &StackOptions,
    ) -> CollaboratorResult<()>;
    fn delete_add_on_stack(&self, name: &str) -> CollaboratorResult<()>;
    fn import_docker_image(&self, archive: &mut dyn Read) -> CollaboratorResult<()>;
    fn delete_docker_images(&self, references: &[String]) -> CollaboratorResult<()>;
    /// Remove volumes of `name` no longer referenced by any container.
    fn remove_unused_volumes(&self, name: &str) -> CollaboratorResult<()>;
    fn list_all_stack_containers(&self, name: &str) -> CollaboratorResult<Vec<ContainerSummary>>;
    fn inspect_container(&self, id: &str) -> CollaboratorResult<ContainerDetails>;
}

/// Reverse proxy fronting add-on web interfaces.
pub trait ReverseProxy: Send + Sync {
    /// Where and how a route of `add_on` is laid out on disk.
    fn layout(&self, add_on: &str, route: &PublishedRoute) -> RouteFile;
    fn write(&self, path: &Path, content: &str) -> CollaboratorResult<()>;
    fn delete(&self, path: &Path) -> CollaboratorResult<()>;
    fn create_symbolic_link(&self, target: &Path, link: &Path) -> CollaboratorResult<()>;
    fn remove_symbolic_link(&self, link: &Path) -> CollaboratorResult<()>;
}

pub trait IamPermissionWriter: Send + Sync {
    fn create(&self, permission: &IamPermission) -> CollaboratorResult<()>;
    fn delete(&self, id: &str) -> CollaboratorResult<()>;
}

/// Manifest checks beyond the ones the engine performs itself.
pub trait Validator: Send + Sync {
    /// Violations found in `manifest`. Empty means valid.
    fn validate(&self, manifest: &AddOnManifest) -> Vec<String>;
}

/// Handles to every collaborator a transaction talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub catalogue: Arc<dyn Catalogue>,
    pub stacks: Arc<dyn StackService>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub iam: Arc<dyn IamPermissionWriter>,
    pub validator: Arc<dyn Validator>,
}

impl Collaborators {
    /// Use a single host object implementing every collaborator contract.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: Catalogue + StackService + ReverseProxy + IamPermissionWriter + Validator + 'static,
    {
        Self {
            catalogue: host.clone(),
            stacks: host.clone(),
            proxy: host.clone(),
            iam: host.clone(),
            validator: host,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> AddOnManifest {
        serde_json::from_str(
            r#"{
                "name": "grafana",
                "title": "Grafana",
                "version": "7.8.9.1",
                "routes": [
                    {"id": "ui", "path": "/addons/grafana", "port": 3000},
                    {"id": "api", "path": "/addons/grafana/api", "port": 3001}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn empty_platform_list_supports_everything() {
        let mut manifest = manifest();
        assert!(manifest.supports_platform("linux/arm64"));
        manifest.platforms = vec!["linux/amd64".into()];
        assert!(!manifest.supports_platform("linux/arm64"));
        assert!(manifest.supports_platform("linux/amd64"));
    }

    #[test]
    fn permission_covers_every_route() {
        let permission = IamPermission::for_manifest(&manifest());
        assert_eq!(permission.id, "addon.grafana");
        assert_eq!(
            permission.paths,
            vec!["/addons/grafana", "/addons/grafana/api"]
        );
    }

    #[test]
    fn image_archive_debug_hides_payload() {
        let archive = ImageArchive {
            reference: "grafana/grafana:7.8".into(),
            data: Bytes::from_static(b"layer-bytes"),
        };
        let rendered = format!("{archive:?}");
        assert!(rendered.contains("grafana/grafana:7.8"));
        assert!(!rendered.contains("layer-bytes"));
    }
}
