//! GCP Projects
//!
//! Functions for listing and looking up GCP projects.

use super::client::GcpClient;
use super::http::ApiError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Project information
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub project_number: String,
    pub lifecycle_state: String,
}

impl Project {
    pub fn is_active(&self) -> bool {
        self.lifecycle_state == "ACTIVE"
    }
}

fn str_field(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

impl From<&Value> for Project {
    fn from(value: &Value) -> Self {
        Self {
            project_id: str_field(value, "projectId", "-"),
            name: str_field(value, "name", "-"),
            project_number: str_field(value, "projectNumber", "-"),
            lifecycle_state: str_field(value, "lifecycleState", "UNKNOWN"),
        }
    }
}

/// Look up a single project
pub async fn get_project(
    client: &GcpClient,
    project_id: &str,
    cancel: &CancellationToken,
) -> Result<Project, ApiError> {
    let url = client.resourcemanager_url(&format!(
        "projects/{}",
        urlencoding::encode(project_id)
    ));
    let response = client.get(&url, cancel).await?;
    Ok(Project::from(&response))
}

/// List all accessible, active GCP projects (follows pagination)
pub async fn list_projects(
    client: &GcpClient,
    cancel: &CancellationToken,
) -> Result<Vec<Project>, ApiError> {
    let mut projects = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut url = client.resourcemanager_url("projects");
        if let Some(token) = &page_token {
            url = format!("{}?pageToken={}", url, urlencoding::encode(token));
        }

        let response = client.get(&url, cancel).await?;

        if let Some(items) = response.get("projects").and_then(|v| v.as_array()) {
            projects.extend(items.iter().map(Project::from).filter(Project::is_active));
        }

        let next_token = response
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if next_token.is_some() && next_token == page_token {
            tracing::warn!("Project listing returned the same page token twice, stopping");
            break;
        }
        page_token = next_token;
        if page_token.is_none() {
            break;
        }
    }

    Ok(projects)
}

/// Get project IDs as a simple list
pub async fn list_project_ids(
    client: &GcpClient,
    cancel: &CancellationToken,
) -> Result<Vec<String>, ApiError> {
    let projects = list_projects(client, cancel).await?;
    Ok(projects.into_iter().map(|p| p.project_id).collect())
}
