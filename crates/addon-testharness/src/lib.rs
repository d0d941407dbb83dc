//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory lifecycle collaborators for tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-memory collaborators and package fixtures for exercising lifecycle
//! transactions without a container runtime or reverse proxy.

pub mod fixtures;
pub mod host;

pub use host::{route_file, HostCall, HostState, RecordingHost, ROUTES_AVAILABLE, ROUTES_ENABLED};
