//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on version ordering and upgrade governance."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Version parsing for add-on packages and the policy deciding which version
//! transitions an update may perform.

pub mod policy;
pub mod version;

pub use policy::{ensure_upgrade, UpgradeKind};
pub use version::{AddOnVersion, VersionError};
