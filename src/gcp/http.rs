//! HTTP transport for GCP REST API calls
//!
//! Every outbound call is an [`ApiRequest`] handed to a [`Transport`].
//! Transports wrap each other; the production stack is
//! rate limit -> retry -> [`AuthenticatedTransport`] (see
//! [`super::client::build_pipeline`]).

use super::auth::GcpCredentials;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
pub(crate) fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Errors produced by the request pipeline
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Connection-level failure (refused, reset, timeout)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// 429 Too Many Requests
    #[error("API request failed: {}", StatusCode::TOO_MANY_REQUESTS)]
    RateLimited { body: String },

    /// 5xx
    #[error("API request failed: {status}")]
    ServerFault { status: StatusCode, body: String },

    /// Any other non-success status
    #[error("API request failed: {status}")]
    Client { status: StatusCode, body: String },

    /// The caller's cancellation token fired
    #[error("request cancelled")]
    Cancelled,

    /// No access token could be obtained
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request could not be built (bad URL, invalid header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to parse response JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited { body }
        } else if status.is_server_error() {
            Self::ServerFault { status, body }
        } else {
            Self::Client { status, body }
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Self::ServerFault { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::Network(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a failed attempt that produced this error may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(err) => !err.is_builder() && !err.is_decode(),
            Self::RateLimited { .. } | Self::ServerFault { .. } => true,
            _ => false,
        }
    }

    /// Short message suitable for display in a resource view.
    /// Cancellation yields an empty string so views can suppress it.
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled => String::new(),
            Self::Network(err) if err.is_timeout() => {
                "Request timed out. Check your network connection and try again.".to_string()
            }
            Self::Network(_) => {
                "Request failed. Check your network connection and try again.".to_string()
            }
            Self::RateLimited { .. } => "Rate limit exceeded. Please try again later.".to_string(),
            Self::ServerFault { .. } => {
                "GCP service temporarily unavailable. Please try again.".to_string()
            }
            Self::Client { status, .. } => match status.as_u16() {
                400 => "Invalid request. Check your parameters.".to_string(),
                401 => "Authentication failed. Run 'gcloud auth application-default login'."
                    .to_string(),
                403 => "Permission denied. Check your GCP IAM permissions.".to_string(),
                404 => "Resource not found.".to_string(),
                409 => "Resource conflict. The resource may already exist or be in use."
                    .to_string(),
                _ => format!("Request failed ({}).", status),
            },
            Self::Auth(_) => {
                "Authentication failed. Run 'gcloud auth application-default login'.".to_string()
            }
            Self::InvalidRequest(_) => "Invalid request. Check your parameters.".to_string(),
            Self::Decode(_) => "Unexpected response from GCP.".to_string(),
        }
    }
}

/// Whether a response status should be retried (429 or 5xx)
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Find an [`ApiError`] anywhere in an error chain
pub fn find_api_error(error: &anyhow::Error) -> Option<&ApiError> {
    error.chain().find_map(|e| e.downcast_ref::<ApiError>())
}

/// True when the error was caused by caller-initiated cancellation
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    find_api_error(error).is_some_and(ApiError::is_cancelled)
}

/// Format an API error for display
/// Security: Sanitizes error messages to avoid leaking sensitive API details
pub fn format_api_error(error: &anyhow::Error) -> String {
    if let Some(api_error) = find_api_error(error) {
        return api_error.user_message();
    }

    let error_str = format!("{:#}", error);

    // Truncate long error messages and remove potential sensitive data
    let sanitized = error_str
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(80)
        .collect::<String>();

    if sanitized.len() < error_str.len() {
        format!("{}...", sanitized)
    } else {
        sanitized
    }
}

/// One logical API call travelling through the pipeline
#[derive(Debug)]
pub struct ApiRequest {
    pub request: Request,
    /// Fires when the caller no longer wants the result
    pub cancel: CancellationToken,
    /// Correlates log lines across retry attempts
    pub id: Uuid,
}

impl ApiRequest {
    pub fn new(request: Request, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            id: Uuid::new_v4(),
        }
    }

    /// Copy for another attempt; `None` when the body is a stream
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            request: self.request.try_clone()?,
            cancel: self.cancel.clone(),
            id: self.id,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A request executor. Implementations may wrap another transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<Response, ApiError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: ApiRequest) -> Result<Response, ApiError> {
        (**self).execute(request).await
    }
}

/// Base transport: attaches a bearer token and performs the network call
#[derive(Clone)]
pub struct AuthenticatedTransport {
    client: Client,
    credentials: GcpCredentials,
}

impl AuthenticatedTransport {
    pub fn new(client: Client, credentials: GcpCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl Transport for AuthenticatedTransport {
    async fn execute(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let ApiRequest {
            request: mut inner,
            cancel,
            id,
        } = request;

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            token = self.credentials.get_token() => {
                token.map_err(|e| ApiError::Auth(format!("{:#}", e)))?
            }
        };

        let header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::InvalidRequest("access token is not a valid header".into()))?;
        inner.headers_mut().insert(AUTHORIZATION, header);

        tracing::debug!(request_id = %id, "{} {}", inner.method(), inner.url());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            result = self.client.execute(inner) => result.map_err(ApiError::Network),
        }
    }
}

/// Read a response body as JSON, mapping non-success status to [`ApiError`]
pub async fn read_json(response: Response) -> Result<serde_json::Value, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        // Security: Only log sanitized/truncated error body to avoid leaking sensitive data
        tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
        return Err(ApiError::from_status(status, body));
    }

    // Handle empty response
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }

    Ok(serde_json::from_str(&body)?)
}
