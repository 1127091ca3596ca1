//! tcloud - resilient access layer for a terminal GCP dashboard
//!
//! - [`gcp`] - rate-limited, retrying request pipeline and project-scoped client
//! - [`service`] - lazily initialized, project-aware resource services
//! - [`cache`] - TTL cache shared by the services
//! - [`config`] - persistent user configuration

pub mod cache;
pub mod config;
pub mod gcp;
pub mod service;

/// Version injected at compile time via TCLOUD_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("TCLOUD_VERSION") {
    Some(v) => v,
    None => "dev",
};
