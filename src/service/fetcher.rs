//! Resource Fetcher
//!
//! Paginated list calls for a [`ResourceKind`] plus light post-processing
//! of each item for display.

use super::resource::ResourceKind;
use crate::gcp::client::GcpClient;
use crate::gcp::http::ApiError;
use chrono::DateTime;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Result of one page fetch
pub struct PaginatedResult {
    pub items: Vec<Value>,
    pub next_token: Option<String>,
}

/// Fetch all resources of `kind` (auto-paginate)
pub async fn fetch_resources(
    kind: ResourceKind,
    client: &GcpClient,
    cancel: &CancellationToken,
) -> Result<Vec<Value>, ApiError> {
    let mut all_items = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let page = fetch_resources_paginated(kind, client, page_token.as_deref(), cancel).await?;
        all_items.extend(page.items);

        match page.next_token {
            Some(token) if page_token.as_deref() == Some(token.as_str()) => {
                tracing::warn!("{} returned the same page token twice, stopping", kind.key());
                break;
            }
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(all_items)
}

/// Fetch one page of resources
pub async fn fetch_resources_paginated(
    kind: ResourceKind,
    client: &GcpClient,
    page_token: Option<&str>,
    cancel: &CancellationToken,
) -> Result<PaginatedResult, ApiError> {
    let mut url = kind.list_url(client);
    if let Some(token) = page_token {
        url = add_query_param(&url, "pageToken", token);
    }

    tracing::debug!("Fetching {} page (token: {:?})", kind.key(), page_token);

    let mut response = client.get(&url, cancel).await?;
    if kind.is_aggregated(client) {
        response = flatten_aggregated_response(response);
    }

    let items = extract_items(&response, kind.response_path())
        .into_iter()
        .map(post_process_item)
        .collect();

    let next_token = response
        .get("nextPageToken")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    Ok(PaginatedResult { items, next_token })
}

/// Append `key=value` to a URL, encoding the value
pub fn add_query_param(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, key, urlencoding::encode(value))
}

/// Flatten an aggregated API response into a standard list response.
/// Aggregated responses look like
/// `{ "items": { "zones/us-central1-a": { "instances": [...] } } }`
/// and become `{ "items": [...], "nextPageToken": ... }`.
pub fn flatten_aggregated_response(response: Value) -> Value {
    let mut flattened = Map::new();
    if let Some(token) = response.get("nextPageToken") {
        flattened.insert("nextPageToken".to_string(), token.clone());
    }

    let all_items: Vec<Value> = response
        .get("items")
        .and_then(|v| v.as_object())
        .into_iter()
        .flat_map(|scopes| scopes.values())
        .filter_map(|scope| scope.as_object())
        .flat_map(|scope| {
            scope
                .iter()
                .filter(|(key, _)| key.as_str() != "warning")
                .filter_map(|(_, value)| value.as_array())
                .flatten()
                .cloned()
        })
        .collect();

    flattened.insert("items".to_string(), Value::Array(all_items));
    Value::Object(flattened)
}

/// Extract items from a response using a dot-separated path
fn extract_items(response: &Value, path: &str) -> Vec<Value> {
    if path.is_empty() {
        return response.as_array().cloned().unwrap_or_default();
    }

    path.split('.')
        .try_fold(response, |current, part| current.get(part))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Add derived display fields (short names, dates, sizes)
fn post_process_item(mut item: Value) -> Value {
    let Value::Object(ref mut map) = item else {
        return item;
    };

    for field in ["zone", "region", "machineType", "type", "network", "location"] {
        if let Some(url) = map.get(field).and_then(|v| v.as_str()) {
            let short = extract_short_name(url);
            map.insert(format!("{}_short", field), Value::String(short));
        }
    }

    // Pub/Sub and friends use fully-qualified names
    if let Some(name) = map.get("name").and_then(|v| v.as_str()) {
        if name.contains('/') {
            map.insert("name_short".to_string(), Value::String(extract_short_name(name)));
        }
    }

    for field in ["creationTimestamp", "timeCreated", "createTime", "updated"] {
        if let Some(ts) = map.get(field).and_then(|v| v.as_str()) {
            let short = format_timestamp_short(ts);
            map.insert(format!("{}_short", field), Value::String(short));
        }
    }

    let size_gb = map
        .get("sizeGb")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok());
    if let Some(gb) = size_gb {
        map.insert(
            "size_display".to_string(),
            Value::String(format_bytes(gb.saturating_mul(1024 * 1024 * 1024))),
        );
    }

    item
}

/// Extract short name from GCP resource URL
/// e.g., "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a" -> "us-central1-a"
fn extract_short_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// Format an RFC 3339 timestamp as a date
fn format_timestamp_short(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => dt.format("%Y-%m-%d").to_string(),
        Err(_) => timestamp.chars().take(10).collect(),
    }
}

/// Format bytes to human readable
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_aggregated_skips_warnings() {
        let response = json!({
            "items": {
                "zones/us-central1-a": { "instances": [{"name": "a"}] },
                "zones/us-east1-b": { "warning": { "code": "NO_RESULTS_ON_PAGE" } },
                "zones/europe-west1-b": { "instances": [{"name": "b"}, {"name": "c"}] }
            },
            "nextPageToken": "next"
        });

        let flat = flatten_aggregated_response(response);
        assert_eq!(flat["items"].as_array().unwrap().len(), 3);
        assert_eq!(flat["nextPageToken"], "next");
    }

    #[test]
    fn test_flatten_without_items() {
        let flat = flatten_aggregated_response(json!({}));
        assert_eq!(flat["items"], json!([]));
    }

    #[test]
    fn test_extract_items_by_path() {
        let response = json!({ "result": { "clusters": [{"name": "c1"}] } });
        assert_eq!(extract_items(&response, "result.clusters").len(), 1);
        assert!(extract_items(&response, "result.missing").is_empty());
        assert!(extract_items(&json!([1, 2]), "").len() == 2);
    }

    #[test]
    fn test_post_process_adds_short_fields() {
        let item = post_process_item(json!({
            "name": "projects/demo-project/topics/orders",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
            "creationTimestamp": "2024-01-15T10:30:00.000-08:00",
            "sizeGb": "10"
        }));

        assert_eq!(item["zone_short"], "us-central1-a");
        assert_eq!(item["name_short"], "orders");
        assert_eq!(item["creationTimestamp_short"], "2024-01-15");
        assert_eq!(item["size_display"], "10.0 GB");
    }

    #[test]
    fn test_add_query_param_encodes() {
        assert_eq!(
            add_query_param("http://x/b?project=p", "pageToken", "a b/c"),
            "http://x/b?project=p&pageToken=a%20b%2Fc"
        );
        assert_eq!(add_query_param("http://x/b", "k", "v"), "http://x/b?k=v");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024 * 1024), "1.0 TB");
    }
}
