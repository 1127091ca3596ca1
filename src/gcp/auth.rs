//! GCP Authentication
//!
//! Handles authentication using Application Default Credentials (ADC),
//! service account keys, or gcloud CLI credentials.

use anyhow::{Context, Result};
use gcp_auth::TokenProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default scopes for GCP API access
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Token expiry buffer - refresh tokens this much before they actually expire
/// This prevents using tokens that are about to expire during a request
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Default token TTL if we can't determine expiry (conservative: 30 minutes)
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Environment variable holding a pre-issued access token
pub const ACCESS_TOKEN_ENV: &str = "CLOUDSDK_AUTH_ACCESS_TOKEN";

/// Where access tokens come from
#[derive(Clone)]
enum TokenSource {
    /// Application Default Credentials
    Provider(Arc<dyn TokenProvider>),
    /// A fixed token (env override, emulators, tests)
    Static(String),
}

/// GCP credentials holder with token caching
#[derive(Clone)]
pub struct GcpCredentials {
    source: TokenSource,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    /// When this token expires (with buffer applied)
    expires_at: Instant,
}

impl CachedToken {
    /// Check if this cached token is still valid
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl GcpCredentials {
    /// Create new GCP credentials.
    /// Uses `CLOUDSDK_AUTH_ACCESS_TOKEN` when set, Application Default Credentials otherwise.
    pub async fn new() -> Result<Self> {
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                tracing::info!("Using access token from {}", ACCESS_TOKEN_ENV);
                return Ok(Self::from_static_token(token.trim()));
            }
        }

        let provider = gcp_auth::provider().await.context(
            "Failed to initialize GCP authentication. Run 'gcloud auth application-default login'",
        )?;

        Ok(Self {
            source: TokenSource::Provider(provider),
            token_cache: Arc::new(RwLock::new(None)),
        })
    }

    /// Credentials that always present the given token
    pub fn from_static_token(token: &str) -> Self {
        Self {
            source: TokenSource::Static(token.to_string()),
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Get an access token for API calls
    /// Security: Checks token expiry before returning cached token
    pub async fn get_token(&self) -> Result<String> {
        let provider = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Provider(provider) => provider,
        };

        // Check cache first - but only return if token is still valid
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_valid() {
                    return Ok(cached.token.clone());
                }
                tracing::debug!("Cached token expired, fetching new token");
            }
        }

        let token = provider
            .token(DEFAULT_SCOPES)
            .await
            .context("Failed to get access token")?;

        let token_str = token.as_str().to_string();

        // gcp_auth does not reliably expose expiry for every provider,
        // so use a conservative TTL
        let expires_at = Instant::now() + DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER;

        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(CachedToken {
                token: token_str.clone(),
                expires_at,
            });
        }

        tracing::debug!(
            "New token cached, expires in ~{} minutes",
            (DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER).as_secs() / 60
        );

        Ok(token_str)
    }

    /// Force refresh the token
    pub async fn refresh_token(&self) -> Result<String> {
        {
            let mut cache = self.token_cache.write().await;
            *cache = None;
        }

        self.get_token().await
    }
}

/// Get the gcloud configuration directory
pub fn get_gcloud_config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CLOUDSDK_CONFIG") {
        return Some(PathBuf::from(path));
    }

    // ~/.config/gcloud on Linux/macOS
    dirs::config_dir().map(|p| p.join("gcloud"))
}

/// Validate a GCP project ID format
/// Project IDs must be 6-30 characters, lowercase letters, digits, and hyphens
/// Must start with a letter and cannot end with a hyphen
pub fn validate_project_id(project: &str) -> bool {
    if project.len() < 6 || project.len() > 30 {
        return false;
    }
    if !project.starts_with(|c: char| c.is_ascii_lowercase()) || project.ends_with('-') {
        return false;
    }

    project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Look up `key` under `[section]` in an INI-style gcloud file
fn find_ini_value(content: &str, section: &str, key: &str) -> Option<String> {
    let mut current: Option<&str> = None;

    for line in content.lines() {
        let line = line.trim();
        // Security: Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name);
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }

    None
}

/// Read a property from the gcloud legacy properties file, then from the
/// active named configuration
fn read_gcloud_property(section: &str, key: &str) -> Option<String> {
    let config_dir = get_gcloud_config_dir()?;

    if let Ok(content) = std::fs::read_to_string(config_dir.join("properties")) {
        if let Some(value) = find_ini_value(&content, section, key) {
            return Some(value);
        }
    }

    let active_config = std::fs::read_to_string(config_dir.join("active_config")).ok()?;
    let config_name = active_config.trim();

    // Security: Validate config name to prevent path traversal
    if !config_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        tracing::warn!("Invalid characters in active_config name");
        return None;
    }

    let config_path = config_dir
        .join("configurations")
        .join(format!("config_{}", config_name));
    let content = std::fs::read_to_string(config_path).ok()?;
    find_ini_value(&content, section, key)
}

/// Read the default project from the environment or gcloud configuration
/// Security: Validates project ID format before returning
pub fn get_default_project() -> Option<String> {
    for var in ["CLOUDSDK_CORE_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"] {
        if let Ok(project) = std::env::var(var) {
            if validate_project_id(&project) {
                return Some(project);
            }
            tracing::warn!("Invalid project ID format in {}", var);
        }
    }

    read_gcloud_property("core", "project").filter(|p| validate_project_id(p))
}

/// Get the default zone from the environment or gcloud configuration
pub fn get_default_zone() -> Option<String> {
    if let Ok(zone) = std::env::var("CLOUDSDK_COMPUTE_ZONE") {
        return Some(zone);
    }

    read_gcloud_property("compute", "zone")
}
