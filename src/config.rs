//! Configuration Management
//!
//! Handles persistent configuration storage for tcloud.

use crate::gcp::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Request pipeline and cache tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Sustained request rate across all resource views
    pub requests_per_second: f64,
    /// Requests allowed back-to-back before pacing kicks in
    pub burst: u32,
    /// Retries after the first attempt on 429/5xx/network errors
    pub max_retries: u32,
    /// Delay before the first retry; doubles each retry
    pub base_backoff_ms: u64,
    /// How long fetched resource lists are reused
    pub cache_ttl_secs: u64,
    /// Base URL replacing the googleapis.com hosts (emulators, tests)
    pub endpoint: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            max_retries: 3,
            base_backoff_ms: 100,
            cache_ttl_secs: 30,
            endpoint: None,
        }
    }
}

impl ApiSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_backoff_ms))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Last used project ID
    #[serde(default)]
    pub project_id: Option<String>,
    /// Last used zone
    #[serde(default)]
    pub zone: Option<String>,
    /// Last viewed resource
    #[serde(default)]
    pub last_resource: Option<String>,
    #[serde(default)]
    pub api: ApiSettings,
}

impl Config {
    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tcloud").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load configuration from a specific file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable config {:?}: {}", path, e);
            Self::default()
        })
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    /// Get effective project (config > gcloud default); CLI flag is applied by the caller
    pub fn effective_project(&self) -> String {
        self.project_id
            .clone()
            .or_else(crate::gcp::auth::get_default_project)
            .unwrap_or_default()
    }

    /// Get effective zone (config > gcloud default)
    pub fn effective_zone(&self) -> String {
        self.zone
            .clone()
            .or_else(crate::gcp::auth::get_default_zone)
            .unwrap_or_else(|| "us-central1-a".to_string())
    }

    /// Remember the current selection and save
    pub fn remember(&mut self, project_id: &str, zone: &str, resource: &str) -> Result<()> {
        self.project_id = Some(project_id.to_string());
        self.zone = Some(zone.to_string());
        self.last_resource = Some(resource.to_string());
        self.save()
    }
}
