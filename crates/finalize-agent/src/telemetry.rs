//! Best-effort run telemetry.
//!
//! One [`TelemetryRecord`] per run, built after the terminal state. Every
//! free-text field is masked (e-mail addresses, API-key-like tokens, long hex
//! strings) and then truncated to `max_field_len` characters plus `...`.
//! Raw model output is included only when `include_raw` is set.
//!
//! Sinks:
//! - [`JsonlTelemetrySink`]: append one JSON line per run
//! - [`HttpTelemetrySink`]: POST the record as JSON
//! - [`NoopTelemetrySink`]: telemetry disabled
//!
//! [`publish_best_effort`] bounds a publish by a timeout and discards every
//! error; nothing here can fail or delay a run beyond that bound.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finalize_gates::{FindingSummary, RawRequest, TelemetryError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::{FinalizeConfig, TelemetryConfig};
use crate::contradiction::SemanticStatus;
use crate::orchestrator::{FinalizeResult, FinalizeStatus, UsageTotals};
use crate::state_machine::FinalizeState;
use crate::validator::RepairInfo;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("EMAIL regex should compile")
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk|lsv2)[_-][A-Za-z0-9_-]{16,}").expect("TOKEN regex should compile")
});

static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{32,}\b").expect("HEX regex should compile"));

/// Replace secrets and personal data with fixed placeholders.
pub fn mask(text: &str) -> String {
    let out = TOKEN_RE.replace_all(text, "[REDACTED_TOKEN]");
    let out = EMAIL_RE.replace_all(&out, "[REDACTED_EMAIL]");
    HEX_RE.replace_all(&out, "[REDACTED_HEX]").into_owned()
}

/// Keep at most `max_chars` characters, appending `...` when cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Mask, then truncate.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    truncate(&mask(text), max_chars)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// First payload validated.
    Valid,
    /// First payload failed, repaired payload validated.
    Repaired,
    /// Both payloads failed.
    Invalid,
    /// The run ended before a payload was validated.
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTelemetry {
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionTelemetry {
    pub summary: FindingSummary,
    pub semantic_status: SemanticStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_error: Option<String>,
}

/// The masked, size-bounded observability record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub trace_id: String,
    pub step: String,
    pub timestamp: DateTime<Utc>,
    pub status: FinalizeStatus,
    pub model: String,
    pub provider: String,
    pub prompt_version: String,
    pub user_input_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_excerpt: Option<String>,
    pub validation: ValidationTelemetry,
    pub repair: RepairInfo,
    pub contradictions: ContradictionTelemetry,
    pub usage: UsageTotals,
    /// `from→to` per transition.
    pub transitions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_excerpt: Option<String>,
}

fn validation_status(result: &FinalizeResult) -> ValidationStatus {
    let reached_validation = result
        .transitions
        .iter()
        .any(|t| t.to == FinalizeState::Validating);
    if !reached_validation {
        ValidationStatus::NotReached
    } else if result.repair.attempted && !result.repair.succeeded {
        // Empty when the repair call itself failed before validation.
        if result.repair.remaining_violations.is_empty() {
            ValidationStatus::NotReached
        } else {
            ValidationStatus::Invalid
        }
    } else if result.repair.succeeded {
        ValidationStatus::Repaired
    } else if result.requirements.is_some() {
        ValidationStatus::Valid
    } else {
        ValidationStatus::NotReached
    }
}

impl TelemetryRecord {
    /// Build the record for a finished run. `raw_output` is the last model
    /// payload text and is dropped unless `include_raw` is set.
    pub fn build(
        request: &RawRequest,
        result: &FinalizeResult,
        raw_output: Option<&str>,
        config: &TelemetryConfig,
    ) -> Self {
        let max = config.max_field_len;
        let repair = RepairInfo {
            attempted: result.repair.attempted,
            succeeded: result.repair.succeeded,
            violations: result.repair.violations.iter().map(|v| sanitize(v, max)).collect(),
            remaining_violations: result
                .repair
                .remaining_violations
                .iter()
                .map(|v| sanitize(v, max))
                .collect(),
        };
        let validation_errors = if repair.remaining_violations.is_empty() {
            repair.violations.clone()
        } else {
            repair.remaining_violations.clone()
        };

        Self {
            trace_id: result.trace_id.clone(),
            step: "finalize".to_string(),
            timestamp: Utc::now(),
            status: result.status,
            model: result.model.clone(),
            provider: result.provider.clone(),
            prompt_version: result.prompt_version.clone(),
            user_input_excerpt: sanitize(&request.text, max),
            context_excerpt: request.context.as_deref().map(|c| sanitize(c, max)),
            validation: ValidationTelemetry {
                status: validation_status(result),
                errors: validation_errors,
            },
            repair,
            contradictions: ContradictionTelemetry {
                summary: FindingSummary::from_findings(&result.findings),
                semantic_status: result.semantic.status,
                semantic_error: result.semantic.error.as_deref().map(|e| sanitize(e, max)),
            },
            usage: result.usage.clone(),
            transitions: result
                .transitions
                .iter()
                .map(|t| format!("{}→{}", t.from, t.to))
                .collect(),
            errors: result
                .errors
                .iter()
                .map(|e| sanitize(&format!("{}@{}: {}", e.kind, e.stage, e.message), max))
                .collect(),
            raw_excerpt: raw_output
                .filter(|_| config.include_raw)
                .map(|raw| sanitize(raw, max)),
        }
    }
}

/// Telemetry collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, record: &TelemetryRecord) -> Result<(), TelemetryError>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopTelemetrySink;

#[async_trait]
impl TelemetrySink for NoopTelemetrySink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _record: &TelemetryRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Append-only JSON Lines file.
#[derive(Debug)]
pub struct JsonlTelemetrySink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlTelemetrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for JsonlTelemetrySink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn publish(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs each record to an HTTP collector.
pub struct HttpTelemetrySink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetrySink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TelemetryError::Transport(format!(
                "collector returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Sink selected by configuration: HTTP endpoint, else JSONL file, else no-op.
pub fn sink_from_config(config: &FinalizeConfig) -> Arc<dyn TelemetrySink> {
    if !config.telemetry.enabled {
        return Arc::new(NoopTelemetrySink);
    }
    if let Some(endpoint) = &config.telemetry.endpoint {
        match HttpTelemetrySink::new(endpoint.clone(), config.telemetry.timeout()) {
            Ok(sink) => return Arc::new(sink),
            Err(e) => debug!(error = %e, "http telemetry sink unavailable, using jsonl"),
        }
    }
    Arc::new(JsonlTelemetrySink::new(config.telemetry_path()))
}

/// Publish within `timeout`, discarding every failure. Returns whether the
/// record was delivered.
pub async fn publish_best_effort(
    sink: &dyn TelemetrySink,
    record: &TelemetryRecord,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, sink.publish(record)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(sink = sink.name(), trace_id = %record.trace_id, error = %e, "telemetry publish failed");
            false
        }
        Err(_) => {
            let err = TelemetryError::Timeout(timeout.as_millis() as u64);
            debug!(sink = sink.name(), trace_id = %record.trace_id, error = %err, "telemetry publish failed");
            false
        }
    }
}
