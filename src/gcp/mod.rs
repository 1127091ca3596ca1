//! GCP API interaction module
//!
//! This module provides the resilient request pipeline used for every call
//! to Google Cloud Platform APIs.
//!
//! # Module Structure
//!
//! - [`auth`] - Credentials and access-token caching
//! - [`http`] - Request type, `Transport` trait, authenticated base transport, errors
//! - [`retry`] - Exponential-backoff retries for 429/5xx/network failures
//! - [`rate_limit`] - Token bucket limiter and the rate-limited transport
//! - [`client`] - Project-scoped JSON client and pipeline assembly
//! - [`projects`] - Project listing
//!
//! # Example
//!
//! ```ignore
//! use crate::gcp::client::GcpClient;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(settings: &ApiSettings) -> anyhow::Result<()> {
//!     let client = GcpClient::connect(settings, "my-project", "us-central1-a").await?;
//!     let cancel = CancellationToken::new();
//!     let instances = client.get(&client.compute_zonal_url("instances"), &cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod http;
pub mod projects;
pub mod rate_limit;
pub mod retry;
