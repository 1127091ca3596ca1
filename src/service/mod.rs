//! Project-scoped resource services
//!
//! A [`Service`] is the client object behind one resource browser. The
//! [`ServiceRegistry`] creates each service lazily from a factory, binds it
//! to the active project, and rebinds it when the project changes.
//!
//! # Architecture
//!
//! - [`registry`] - Lazy construction and (re)initialization per service name
//! - [`resource`] - Concrete services for each browsable resource kind
//! - [`fetcher`] - Paginated list calls and display post-processing

pub mod fetcher;
pub mod registry;
pub mod resource;

pub use registry::{ReinitReport, RegistryError, ServiceHandle, ServiceRegistry};
pub use resource::{register_resource_services, ResourceKind, ResourceService};

use crate::cache::SharedCache;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Contract every registered service fulfils
#[async_trait]
pub trait Service: Send + Sync {
    /// Establish connectivity for `project_id`. Called once, on first access.
    async fn init_service(&self, cancel: &CancellationToken, project_id: &str) -> Result<()>;

    /// Discard state for the previous project and bind to `project_id`
    async fn reinit(&self, cancel: &CancellationToken, project_id: &str) -> Result<()>;

    /// List the resources this service browses
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Value>>;
}

/// Builds a service instance around the shared cache
pub type ServiceFactory = Arc<dyn Fn(SharedCache) -> Arc<dyn Service> + Send + Sync>;
