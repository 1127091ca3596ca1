//! GCP Client
//!
//! Project-scoped JSON client. Every call goes through the shared
//! request pipeline built by [`build_pipeline`].

use super::auth::GcpCredentials;
use super::http::{read_json, ApiError, ApiRequest, AuthenticatedTransport, Transport};
use super::rate_limit::{RateLimitedTransport, TokenBucket};
use super::retry::RetryTransport;
use crate::config::ApiSettings;
use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Per-attempt network timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the reqwest client shared by request building and the base transport
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("tcloud/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Assemble caller -> rate limit -> retry -> authenticated base.
/// Called once per process; the result is shared by every service.
pub fn build_pipeline(
    settings: &ApiSettings,
    http: Client,
    credentials: GcpCredentials,
) -> Arc<dyn Transport> {
    let base = AuthenticatedTransport::new(http, credentials);
    let retry = RetryTransport::new(base, settings.retry_policy());
    let limiter = Arc::new(TokenBucket::new(
        settings.requests_per_second,
        f64::from(settings.burst),
    ));

    tracing::debug!(
        rps = settings.requests_per_second,
        burst = settings.burst,
        max_retries = settings.max_retries,
        "Request pipeline ready"
    );

    Arc::new(RateLimitedTransport::new(limiter, retry))
}

/// Main GCP client
#[derive(Clone)]
pub struct GcpClient {
    transport: Arc<dyn Transport>,
    http: Client,
    endpoint: Option<Url>,
    pub project_id: String,
    pub zone: String,
}

impl GcpClient {
    /// Create a client over an existing pipeline
    pub fn new(transport: Arc<dyn Transport>, http: Client, project_id: &str, zone: &str) -> Self {
        Self {
            transport,
            http,
            endpoint: None,
            project_id: project_id.to_string(),
            zone: zone.to_string(),
        }
    }

    /// Authenticate and build the full pipeline from settings
    pub async fn connect(settings: &ApiSettings, project_id: &str, zone: &str) -> Result<Self> {
        let credentials = GcpCredentials::new()
            .await
            .context("Failed to initialize GCP credentials")?;
        let http = http_client()?;
        let transport = build_pipeline(settings, http.clone(), credentials);

        let client = Self::new(transport, http, project_id, zone);
        match settings.endpoint.as_deref() {
            Some(endpoint) => client.with_endpoint(endpoint),
            None => Ok(client),
        }
    }

    /// Send all API calls to `endpoint` instead of the googleapis.com hosts
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint).with_context(|| format!("Invalid endpoint: {}", endpoint))?;
        self.endpoint = Some(url);
        Ok(self)
    }

    /// Same pipeline, bound to another project
    pub fn with_project(&self, project_id: &str) -> Self {
        let mut client = self.clone();
        client.project_id = project_id.to_string();
        client
    }

    /// Make a GET request to a GCP API
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Value, ApiError> {
        self.send(Method::GET, url, None, cancel).await
    }

    /// Make a POST request to a GCP API
    pub async fn post(
        &self,
        url: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ApiError> {
        self.send(Method::POST, url, body, cancel).await
    }

    /// Make a DELETE request to a GCP API
    pub async fn delete(&self, url: &str, cancel: &CancellationToken) -> Result<Value, ApiError> {
        self.send(Method::DELETE, url, None, cancel).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ApiError> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = builder
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let response = self
            .transport
            .execute(ApiRequest::new(request, cancel.clone()))
            .await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            result = read_json(response) => result,
        }
    }

    /// Get the region from the current zone
    pub fn get_region(&self) -> String {
        match self.zone.rsplit_once('-') {
            Some((region, _)) => region.to_string(),
            None => self.zone.clone(),
        }
    }

    /// Base URL for a googleapis.com host, or the configured endpoint
    fn api_base(&self, host: &str) -> String {
        match &self.endpoint {
            Some(url) => url.as_str().trim_end_matches('/').to_string(),
            None => format!("https://{}", host),
        }
    }

    // =========================================================================
    // Compute Engine API helpers
    // =========================================================================

    /// Build Compute Engine API URL
    pub fn compute_url(&self, path: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/{}",
            self.api_base("compute.googleapis.com"),
            self.project_id,
            path
        )
    }

    /// Build zonal Compute Engine API URL
    pub fn compute_zonal_url(&self, resource: &str) -> String {
        self.compute_url(&format!("zones/{}/{}", self.zone, resource))
    }

    /// Build regional Compute Engine API URL
    pub fn compute_regional_url(&self, resource: &str) -> String {
        self.compute_url(&format!("regions/{}/{}", self.get_region(), resource))
    }

    /// Build global Compute Engine API URL
    pub fn compute_global_url(&self, resource: &str) -> String {
        self.compute_url(&format!("global/{}", resource))
    }

    /// Build aggregated Compute Engine API URL (all zones)
    pub fn compute_aggregated_url(&self, resource: &str) -> String {
        self.compute_url(&format!("aggregated/{}", resource))
    }

    // =========================================================================
    // Other services
    // =========================================================================

    /// Build Cloud Storage API URL
    pub fn storage_url(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.api_base("storage.googleapis.com"), path)
    }

    /// Build GKE location URL (region, zone or "-" for all)
    pub fn container_location_url(&self, location: &str, resource: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/{}",
            self.api_base("container.googleapis.com"),
            self.project_id,
            location,
            resource
        )
    }

    /// Build Pub/Sub API URL
    pub fn pubsub_url(&self, resource: &str) -> String {
        format!(
            "{}/v1/projects/{}/{}",
            self.api_base("pubsub.googleapis.com"),
            self.project_id,
            resource
        )
    }

    /// Build Resource Manager API URL
    pub fn resourcemanager_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.api_base("cloudresourcemanager.googleapis.com"),
            path
        )
    }
}
