//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on version ordering and upgrade governance."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::cmp::Ordering;

use tracing::debug;

use crate::version::{AddOnVersion, VersionError};

/// Classification of an accepted version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    /// The requested version is newer than the installed one.
    Upgrade,
    /// The requested version equals the installed one.
    Reinstall,
}

/// Accept `requested` as a replacement for `installed` unless it is a downgrade.
pub fn ensure_upgrade(
    installed: &AddOnVersion,
    requested: &AddOnVersion,
) -> Result<UpgradeKind, VersionError> {
    match requested.cmp(installed) {
        Ordering::Less => {
            debug!(%installed, %requested, "rejecting add-on downgrade");
            Err(VersionError::Downgrade {
                installed: installed.clone(),
                requested: requested.clone(),
            })
        }
        Ordering::Equal => Ok(UpgradeKind::Reinstall),
        Ordering::Greater => Ok(UpgradeKind::Upgrade),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(input: &str) -> AddOnVersion {
        input.parse().unwrap()
    }

    #[test]
    fn newer_version_is_an_upgrade() {
        assert_eq!(
            ensure_upgrade(&v("1.2.3"), &v("1.2.4")).unwrap(),
            UpgradeKind::Upgrade
        );
    }

    #[test]
    fn same_version_is_a_reinstall() {
        assert_eq!(
            ensure_upgrade(&v("7.8.9.1"), &v("7.8.9.1")).unwrap(),
            UpgradeKind::Reinstall
        );
    }

    #[test]
    fn older_version_is_rejected() {
        let err = ensure_upgrade(&v("7.8.9.1"), &v("7.8.9")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "downgrade from 7.8.9.1 to 7.8.9 is not allowed"
        );
    }
}
