//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Host wiring for the add-on lifecycle service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use addon_common::{init_tracing, AppConfig};
use anyhow::{Context, Result};
use prometheus::Registry;
use tracing::info;

use crate::collaborators::Collaborators;
use crate::lifecycle::LifecycleService;

/// Bring up a host process: validate `config`, install tracing, then build the service.
pub fn bootstrap(
    service_name: &str,
    config: &AppConfig,
    collaborators: Collaborators,
    registry: Arc<Registry>,
) -> Result<LifecycleService> {
    config.validate()?;
    init_tracing(service_name, &config.logging)
        .with_context(|| format!("failed to initialise tracing for {service_name}"))?;
    let service = LifecycleService::from_config(config, collaborators, registry)
        .context("failed to register lifecycle metrics")?;
    info!(
        service = %service_name,
        platform = %config.lifecycle.platform,
        heartbeat_ms = service.heartbeat_interval().as_millis() as u64,
        metrics = config.metrics.enabled,
        "add-on lifecycle service ready"
    );
    Ok(service)
}
