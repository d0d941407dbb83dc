//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory lifecycle collaborators for tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use addon_core::{AddOnManifest, AddOnPackage, ImageArchive, PublishedRoute, SettingSpec};
use addon_versioning::AddOnVersion;
use bytes::Bytes;
use indexmap::IndexMap;

/// Parse a version literal.
///
/// # Panics
///
/// Panics on an invalid literal.
pub fn version(input: &str) -> AddOnVersion {
    match AddOnVersion::parse(input) {
        Ok(version) => version,
        Err(err) => panic!("invalid version literal {input}: {err}"),
    }
}

/// Image reference shipped by [`package`].
pub fn image_reference(name: &str, version: &str) -> String {
    format!("registry.local/{name}:{version}")
}

/// Package with one image, two routes (`ui`, `api`), a required setting
/// with a default (`ADMIN_USER`) and an optional one (`THEME`).
pub fn package(name: &str, version_literal: &str) -> AddOnPackage {
    let reference = image_reference(name, version_literal);
    AddOnPackage {
        manifest: AddOnManifest {
            name: name.to_owned(),
            title: title(name),
            version: version(version_literal),
            platforms: vec!["linux/arm64".into(), "linux/amd64".into()],
            settings: vec![
                SettingSpec {
                    key: "ADMIN_USER".into(),
                    required: true,
                    default: Some("admin".into()),
                },
                SettingSpec {
                    key: "THEME".into(),
                    required: false,
                    default: None,
                },
            ],
            routes: vec![
                PublishedRoute {
                    id: "ui".into(),
                    path: format!("/addons/{name}"),
                    port: 3000,
                },
                PublishedRoute {
                    id: "api".into(),
                    path: format!("/addons/{name}/api"),
                    port: 3001,
                },
            ],
        },
        compose: format!("services:\n  app:\n    image: {reference}\n"),
        images: vec![ImageArchive {
            data: Bytes::from(reference.clone()),
            reference,
        }],
    }
}

/// Display title used by [`package`].
pub fn title(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Settings a default install of [`package`] runs with.
pub fn default_settings() -> IndexMap<String, String> {
    IndexMap::from([("ADMIN_USER".to_owned(), "admin".to_owned())])
}
