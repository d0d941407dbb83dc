//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Replace and delete routines, including rollback across both halves."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;

use addon_core::{
    CompensationKind, InstallRequest, LifecycleError, Operation, TransactionScheduler,
    TransactionSettings, ValidationError,
};
use addon_testharness::fixtures::{self, default_settings, image_reference, version};
use addon_testharness::{HostCall, RecordingHost, ROUTES_ENABLED};
use addon_versioning::VersionError;
use indexmap::IndexMap;

fn scheduler() -> Arc<TransactionScheduler> {
    TransactionScheduler::new(TransactionSettings::default(), None)
}

fn customised_settings() -> IndexMap<String, String> {
    IndexMap::from([
        ("ADMIN_USER".to_owned(), "root".to_owned()),
        ("THEME".to_owned(), "dark".to_owned()),
    ])
}

fn installed(version_literal: &str) -> Arc<RecordingHost> {
    let host = RecordingHost::new();
    host.seed_installed(
        fixtures::package("grafana", version_literal),
        customised_settings(),
    );
    host
}

#[test]
fn downgrade_is_refused_without_side_effects() {
    let host = installed("7.8.9.1");
    host.publish(fixtures::package("grafana", "7.8.9"));
    let scheduler = scheduler();
    let mut txn = scheduler
        .create_transaction("grafana", Operation::Updating, host.collaborators())
        .unwrap();

    let err = txn
        .replace_add_on_routine(&InstallRequest::new("grafana", version("7.8.9")))
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Validation(ValidationError::Version(VersionError::Downgrade { .. }))
    ));
    assert_eq!(
        err.to_string(),
        "downgrade from 7.8.9.1 to 7.8.9 is not allowed"
    );
    assert!(host.journal().is_empty());
    assert!(txn.pending_compensations().is_empty());
    txn.rollback();
    assert!(host.journal().is_empty());
}

#[test]
fn upgrade_removes_then_installs() {
    let host = installed("1.0.0");
    host.publish(fixtures::package("grafana", "1.1.0"));
    let scheduler = scheduler();
    let txn = scheduler
        .create_transaction("grafana", Operation::Updating, host.collaborators())
        .unwrap();

    txn.execute(|txn| {
        txn.replace_add_on_routine(&InstallRequest::new("grafana", version("1.1.0")))
    })
    .unwrap();

    let journal = host.journal();
    let removal = journal
        .iter()
        .position(|call| matches!(call, HostCall::DeleteAddOn { .. }))
        .unwrap();
    let pull = journal
        .iter()
        .position(|call| matches!(call, HostCall::PullAddOn { .. }))
        .unwrap();
    assert!(removal < pull);
    assert_eq!(
        journal[0],
        HostCall::RemoveSymlink {
            link: Path::new(ROUTES_ENABLED).join("grafana-ui.conf"),
        }
    );

    let state = host.state();
    assert_eq!(state.catalogue.get("grafana"), Some(&version("1.1.0")));
    assert!(state.images.contains(&image_reference("grafana", "1.1.0")));
    assert!(!state.images.contains(&image_reference("grafana", "1.0.0")));
    assert_eq!(state.stacks.get("grafana"), Some(&default_settings()));
}

#[test]
fn reinstalling_the_same_version_is_allowed() {
    let host = installed("7.8.9.1");
    let scheduler = scheduler();
    let txn = scheduler
        .create_transaction("grafana", Operation::Updating, host.collaborators())
        .unwrap();
    txn.execute(|txn| {
        txn.replace_add_on_routine(&InstallRequest::new("grafana", version("7.8.9.1")))
    })
    .unwrap();
    assert_eq!(host.state().catalogue.get("grafana"), Some(&version("7.8.9.1")));
}

#[test]
fn failed_creation_half_restores_previous_version() {
    let host = installed("1.0.0");
    host.publish(fixtures::package("grafana", "1.1.0"));
    let before = host.state();
    host.fail_once(
        |call| matches!(call, HostCall::CreateStack { .. }),
        "compose rejected",
    );
    let scheduler = scheduler();
    let txn = scheduler
        .create_transaction("grafana", Operation::Updating, host.collaborators())
        .unwrap();

    let err = txn
        .execute(|txn| {
            txn.replace_add_on_routine(&InstallRequest::new("grafana", version("1.1.0")))
        })
        .unwrap_err();

    assert_eq!(err.to_string(), "docker stack error: compose rejected");
    assert_eq!(host.state(), before);
    assert!(!scheduler.is_transaction_open());

    let journal = host.journal();
    let failed = journal
        .iter()
        .position(|call| matches!(call, HostCall::CreateStack { .. }))
        .unwrap();
    assert_eq!(
        journal[failed + 1..].to_vec(),
        vec![
            HostCall::DeleteImages {
                references: vec![image_reference("grafana", "1.1.0")],
            },
            HostCall::DeleteAddOn {
                name: "grafana".into(),
            },
            HostCall::PullAddOn {
                name: "grafana".into(),
                version: "1.0.0".into(),
            },
            HostCall::ImportImage {
                reference: image_reference("grafana", "1.0.0"),
            },
            HostCall::CreateStack {
                name: "grafana".into(),
                settings: customised_settings(),
            },
            HostCall::CreatePermission {
                id: "addon.grafana".into(),
            },
            HostCall::WriteFile {
                path: Path::new(addon_testharness::ROUTES_AVAILABLE).join("grafana-api.conf"),
            },
            HostCall::CreateSymlink {
                link: Path::new(ROUTES_ENABLED).join("grafana-api.conf"),
            },
            HostCall::WriteFile {
                path: Path::new(addon_testharness::ROUTES_AVAILABLE).join("grafana-ui.conf"),
            },
            HostCall::CreateSymlink {
                link: Path::new(ROUTES_ENABLED).join("grafana-ui.conf"),
            },
        ]
    );
}

#[test]
fn delete_removes_everything() {
    let host = installed("7.8.9.1");
    let scheduler = scheduler();
    let txn = scheduler
        .create_transaction("grafana", Operation::Deleting, host.collaborators())
        .unwrap();

    txn.execute(|txn| txn.delete_add_on_routine("grafana"))
        .unwrap();

    let state = host.state();
    assert!(state.catalogue.is_empty());
    assert!(state.stacks.is_empty());
    assert!(state.volumes.is_empty());
    assert!(state.images.is_empty());
    assert!(state.permissions.is_empty());
    assert!(state.files.is_empty());
    assert!(state.links.is_empty());
}

#[test]
fn failed_delete_recreates_stack_with_running_settings() {
    let host = installed("7.8.9.1");
    let before = host.state();
    host.fail_on(
        |call| matches!(call, HostCall::DeleteAddOn { .. }),
        "catalogue locked",
    );
    let scheduler = scheduler();
    let mut txn = scheduler
        .create_transaction("grafana", Operation::Deleting, host.collaborators())
        .unwrap();

    let err = txn.delete_add_on_routine("grafana").unwrap_err();
    assert_eq!(err.to_string(), "catalogue removal error: catalogue locked");
    let pending: Vec<_> = txn
        .pending_compensations()
        .iter()
        .map(|c| c.kind())
        .collect();
    assert_eq!(
        pending,
        vec![
            CompensationKind::ImportImages,
            CompensationKind::CreateStack,
            CompensationKind::CreatePermission,
            CompensationKind::WriteFile,
            CompensationKind::CreateSymlink,
            CompensationKind::WriteFile,
            CompensationKind::CreateSymlink,
        ]
    );

    let report = txn.rollback();
    assert!(report.is_clean());
    assert!(host.journal().contains(&HostCall::CreateStack {
        name: "grafana".into(),
        settings: customised_settings(),
    }));
    assert_eq!(host.state(), before);
}

#[test]
fn deleting_an_unknown_add_on_is_a_validation_error() {
    let host = RecordingHost::new();
    let scheduler = scheduler();
    let txn = scheduler
        .create_transaction("grafana", Operation::Deleting, host.collaborators())
        .unwrap();

    let err = txn
        .execute(|txn| txn.delete_add_on_routine("grafana"))
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Validation(ValidationError::NotInstalled(ref name)) if name == "grafana"
    ));
    assert!(host.journal().is_empty());
}
