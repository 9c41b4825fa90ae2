use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failure of a single provider round-trip, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider '{0}' has no API key configured")]
    NotConfigured(String),
    #[error("provider '{provider}' rejected the credentials: {message}")]
    Auth { provider: String, message: String },
    #[error("provider '{provider}' timed out after {after:?}")]
    Timeout { provider: String, after: Duration },
    #[error("provider '{provider}' is unreachable: {message}")]
    Unreachable { provider: String, message: String },
    #[error("transient failure from provider '{provider}': {message}")]
    Transient { provider: String, message: String },
    #[error("provider '{provider}' rejected the request (HTTP {status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("malformed response from provider '{provider}': {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    /// Timeouts and network-level failures are worth one more attempt; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. } | ProviderError::Unreachable { .. } | ProviderError::Transient { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("step {step} rejected with HTTP {status}: {body}")]
    Rejected { step: String, status: u16, body: String },
    #[error("platform task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed for {url}: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("failed to parse feed from {url}: {message}")]
    Parse { url: String, message: String },
}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider '{0}' is not configured")]
    ProviderNotConfigured(String),
    #[error("provider '{provider}' rejected the credentials: {message}")]
    Auth { provider: String, message: String },
    #[error("provider '{provider}' is unreachable: {message}")]
    ProviderUnreachable { provider: String, message: String },
    #[error("provider '{provider}' failed after {attempts} attempt(s): {last}")]
    ProviderFailed {
        provider: String,
        attempts: u32,
        last: ProviderError,
    },
    #[error("no provider is enabled and available")]
    NoProviderAvailable,
    #[error("provider '{0}' is disabled")]
    ProviderDisabled(String),
    #[error("invalid rotation strategy '{0}' (expected 'sequential' or 'random')")]
    InvalidStrategy(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("unknown feed source '{0}'")]
    UnknownFeed(String),
    #[error("article '{0}' not found")]
    ArticleNotFound(String),
    #[error("no running generation session '{0}'")]
    UnknownSession(String),
    #[error("publish targets must not be empty")]
    EmptyTargets,
    #[error("feed '{feed}' is unavailable and nothing is cached: {message}")]
    FeedUnavailable { feed: String, message: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ProviderNotConfigured(_) => "provider_not_configured",
            EngineError::Auth { .. } => "auth_error",
            EngineError::ProviderUnreachable { .. } => "provider_unreachable",
            EngineError::ProviderFailed { .. } => "provider_failed",
            EngineError::NoProviderAvailable => "no_provider_available",
            EngineError::ProviderDisabled(_) => "provider_disabled",
            EngineError::InvalidStrategy(_) => "invalid_strategy",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::UnknownProvider(_) => "unknown_provider",
            EngineError::UnknownFeed(_) => "unknown_feed",
            EngineError::ArticleNotFound(_) => "article_not_found",
            EngineError::UnknownSession(_) => "unknown_session",
            EngineError::EmptyTargets => "empty_targets",
            EngineError::FeedUnavailable { .. } => "feed_unavailable",
            EngineError::Storage(_) => "internal",
        }
    }

    /// Remediation shown to the user next to the error.
    pub fn hint(&self) -> Option<String> {
        match self {
            EngineError::ProviderNotConfigured(name) | EngineError::Auth { provider: name, .. } => {
                Some(format!("configure the API key for provider '{name}'"))
            }
            EngineError::NoProviderAvailable => {
                Some("enable at least one configured provider and test its connection".to_string())
            }
            EngineError::ProviderDisabled(name) => Some(format!("enable provider '{name}' or pick another one")),
            EngineError::ProviderFailed { .. } | EngineError::ProviderUnreachable { .. } => {
                Some("try again later or switch to another provider".to_string())
            }
            _ => None,
        }
    }

    /// Log the full error under a fresh trace id and return the caller-facing view.
    pub fn surface(&self) -> SurfacedError {
        let trace_id = Uuid::new_v4().to_string();
        error!(trace_id = %trace_id, kind = self.kind(), error = %self, "request failed");
        let message = match self {
            // Internal details stay in the log; the trace id is what gets reported back.
            EngineError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        SurfacedError {
            trace_id,
            kind: self.kind().to_string(),
            message,
            hint: self.hint(),
        }
    }
}

/// Caller-facing error: an opaque trace id plus a readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfacedError {
    pub trace_id: String,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let timeout = ProviderError::Timeout {
            provider: "a".into(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        let auth = ProviderError::Auth {
            provider: "a".into(),
            message: "bad key".into(),
        };
        assert!(!auth.is_retryable());
        let rejected = ProviderError::Rejected {
            provider: "a".into(),
            status: 400,
            message: "bad request".into(),
        };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn surfaced_error_carries_trace_id_and_hint() {
        let surfaced = EngineError::ProviderNotConfigured("deepseek".into()).surface();
        assert_eq!(surfaced.kind, "provider_not_configured");
        assert!(Uuid::parse_str(&surfaced.trace_id).is_ok());
        assert!(surfaced.hint.unwrap().contains("API key"));
    }

    #[test]
    fn storage_errors_hide_internals() {
        let surfaced = EngineError::Storage(anyhow::anyhow!("disk I/O error at /var/db")).surface();
        assert_eq!(surfaced.message, "internal error");
        assert_eq!(surfaced.kind, "internal");
    }
}
