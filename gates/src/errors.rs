//! Error taxonomy for the finalize pipeline with explicit retry classification.
//!
//! Every failure that can end or degrade a run is represented here. Callers
//! branch on `retryable` / [`ErrorKind`] rather than on message text.
//!
//! | Error              | Retried                          | Surfaced as            |
//! |--------------------|----------------------------------|------------------------|
//! | `UpstreamError`    | when `retryable` (timeout, 429, 5xx) | `FAILED` after retries |
//! | `ValidationError`  | one repair call, never a second  | `FAILED`               |
//! | `BudgetExceeded`   | never                            | `FAILED`               |
//! | `TelemetryError`   | never                            | swallowed              |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::TokenUsage;

/// Failure class reported by the model call collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// The request did not complete within the configured timeout.
    Timeout,
    /// The provider asked us to slow down (HTTP 429).
    RateLimited,
    /// The provider answered but the envelope could not be read.
    InvalidResponse,
    /// Any other provider-side failure (4xx, 5xx, connection refused).
    ProviderError,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::InvalidResponse => write!(f, "invalid_response"),
            Self::ProviderError => write!(f, "provider_error"),
        }
    }
}

/// A typed failure from the model call collaborator.
///
/// The retry loop branches only on `retryable`; `kind` is for diagnostics.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("upstream {kind}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub retryable: bool,
    pub message: String,
    /// HTTP status when the provider returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Token usage the provider reported for the failed attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl UpstreamError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Timeout,
            retryable: true,
            message: message.into(),
            status: None,
            usage: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::RateLimited,
            retryable: true,
            message: message.into(),
            status: Some(429),
            usage: None,
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::InvalidResponse,
            retryable: false,
            message: message.into(),
            status: None,
            usage: None,
        }
    }

    /// Provider failure. 5xx and status-less (connection) failures are
    /// transient; 4xx are not.
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        let retryable = match status {
            Some(code) => code >= 500,
            None => true,
        };
        Self {
            kind: UpstreamErrorKind::ProviderError,
            retryable,
            message: message.into(),
            status,
            usage: None,
        }
    }

    /// Attach provider-reported usage for the failed attempt.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Structural violations found in a model payload.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("payload failed validation ({} violation(s)): {}", violations.len(), violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }
}

/// Why the budget guard refused a call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetExceeded {
    /// The estimated prompt alone is larger than the per-call ceiling.
    #[error("estimated input of {estimated} tokens exceeds per-call ceiling of {limit}")]
    PerCallCeiling { estimated: u64, limit: u64 },

    /// Reserving the call would push the rolling window past its quota.
    #[error(
        "daily quota of {quota} tokens exhausted ({used} used, {reserved} in flight, {requested} requested)"
    )]
    DailyQuota {
        used: u64,
        reserved: u64,
        requested: u64,
        quota: u64,
    },
}

/// Telemetry failures. Never surfaced to the caller of a run.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("telemetry io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry transport failed: {0}")]
    Transport(String),

    #[error("telemetry publish timed out after {0}ms")]
    Timeout(u64),
}

/// Coarse error class recorded on a run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Upstream,
    Validation,
    BudgetExceeded,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Validation => write!(f, "validation"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Serializable diagnostic attached to a `FinalizeResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Pipeline stage that produced the error (snake_case state name).
    pub stage: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_kind: Option<UpstreamErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl ErrorRecord {
    pub fn upstream(stage: &str, err: &UpstreamError) -> Self {
        Self {
            kind: ErrorKind::Upstream,
            stage: stage.to_string(),
            message: err.to_string(),
            retryable: err.retryable,
            upstream_kind: Some(err.kind),
            violations: Vec::new(),
        }
    }

    pub fn validation(stage: &str, err: &ValidationError) -> Self {
        Self {
            kind: ErrorKind::Validation,
            stage: stage.to_string(),
            message: err.to_string(),
            retryable: false,
            upstream_kind: None,
            violations: err.violations.clone(),
        }
    }

    pub fn budget(stage: &str, err: &BudgetExceeded) -> Self {
        Self {
            kind: ErrorKind::BudgetExceeded,
            stage: stage.to_string(),
            message: err.to_string(),
            retryable: false,
            upstream_kind: None,
            violations: Vec::new(),
        }
    }

    pub fn cancelled(stage: &str, reason: &str) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            stage: stage.to_string(),
            message: format!("run cancelled: {reason}"),
            retryable: false,
            upstream_kind: None,
            violations: Vec::new(),
        }
    }

    pub fn internal(stage: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            stage: stage.to_string(),
            message: message.into(),
            retryable: false,
            upstream_kind: None,
            violations: Vec::new(),
        }
    }
}
