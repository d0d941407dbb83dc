//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives for the add-on lifecycle manager."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the add-on manager workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the lifecycle engine and its hosts.

pub mod config;
pub mod logging;

pub use config::{AppConfig, LifecycleConfig, LoadedAppConfig, LoggingConfig, MetricsConfig};
pub use logging::{init_tracing, LogFormat, LOG_ENV};
