//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration tests for the add-on lifecycle service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use addon_common::{AppConfig, LogFormat};
use addon_core::{bootstrap, silent_heartbeat, InstallRequest, LifecycleService, TransactionSettings};
use addon_testharness::fixtures::{self, version};
use addon_testharness::RecordingHost;
use prometheus::Registry;

fn addon_families(registry: &Registry) -> Vec<String> {
    registry
        .gather()
        .into_iter()
        .map(|family| family.get_name().to_owned())
        .filter(|name| name.starts_with("addon_"))
        .collect()
}

fn reference_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/addon-manager.toml");
    AppConfig::load(&[path]).expect("reference configuration should load")
}

#[test]
fn reference_configuration_is_valid() {
    let config = reference_config();
    assert_eq!(config.lifecycle.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(config.lifecycle.platform, "linux/arm64");
    assert!(config.lifecycle.prune_volumes_on_failure);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert_eq!(
        config.logging.directory.as_deref(),
        Some(Path::new("/var/log/addon-manager"))
    );
    assert!(config.metrics.enabled);
}

#[test]
fn service_adopts_lifecycle_settings() {
    let config = reference_config();
    let host = RecordingHost::new();
    let service = LifecycleService::new(&config.lifecycle, host.collaborators(), None);
    assert_eq!(
        service.scheduler().settings(),
        &TransactionSettings::from(&config.lifecycle)
    );
    assert!(!service.scheduler().is_transaction_open());
}

#[test]
fn disabled_metrics_register_nothing() {
    let config: AppConfig = "[metrics]\nenabled = false".parse().unwrap();
    let registry = Arc::new(Registry::new());
    let host = RecordingHost::new();

    LifecycleService::from_config(&config, host.collaborators(), registry.clone()).unwrap();
    assert!(addon_families(&registry).is_empty());
}

#[test]
fn enabled_metrics_register_transaction_families() {
    let config = AppConfig::default();
    let registry = Arc::new(Registry::new());
    let host = RecordingHost::new();

    LifecycleService::from_config(&config, host.collaborators(), registry.clone()).unwrap();
    let families = addon_families(&registry);
    assert!(families.contains(&"addon_transaction_open".to_owned()));
    assert!(families.contains(&"addon_transaction_busy_total".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_wires_logging_metrics_and_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.lifecycle.heartbeat_interval = Duration::from_millis(50);
    config.logging.directory = Some(dir.path().join("logs"));
    config.logging.format = LogFormat::Pretty;
    let registry = Arc::new(Registry::new());
    let host = RecordingHost::new();
    host.publish(fixtures::package("grafana", "7.8.9.1"));

    let service = bootstrap("addon-manager", &config, host.collaborators(), registry.clone())
        .unwrap();
    assert!(dir.path().join("logs").is_dir());
    assert_eq!(service.heartbeat_interval(), Duration::from_millis(50));

    service
        .install(InstallRequest::new("grafana", version("7.8.9.1")), silent_heartbeat)
        .await
        .unwrap();
    let committed = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "addon_transactions_total")
        .map(|family| family.get_metric()[0].get_counter().get_value());
    assert_eq!(committed, Some(1.0));
}

#[test]
fn bootstrap_rejects_invalid_configuration() {
    let mut config = AppConfig::default();
    config.lifecycle.heartbeat_interval = Duration::ZERO;
    let host = RecordingHost::new();

    let err = bootstrap(
        "addon-manager",
        &config,
        host.collaborators(),
        Arc::new(Registry::new()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("heartbeat_interval"));
}
