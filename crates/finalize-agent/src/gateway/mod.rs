//! Model call gateway: budget reservation, timeout, retry with backoff, and
//! per-attempt usage accounting around a [`ModelClient`].
//!
//! ```text
//!  call(request)
//!    loop attempt:
//!      budget.check_and_reserve(estimate) ── BudgetExceeded ──► Err (no network)
//!      select { cancel ─► release, Err(Cancelled)
//!               timeout(client.send) }
//!      commit actual usage (success or failure)
//!      ok                       ──► ModelResponse
//!      retryable && retries left ──► sleep(backoff) and loop
//!      otherwise                 ──► Err(Upstream)
//! ```
//!
//! The retry loop branches only on [`UpstreamError::retryable`]. Retry state
//! is local to one call; concurrent runs never coordinate backoff.

pub mod openai;
pub mod stub;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use finalize_gates::{
    BudgetExceeded, BudgetGuard, CharCountEstimator, ErrorRecord, RetryPolicy, TokenEstimator,
    TokenUsage, UpstreamError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a call is being made. Clients may use it to pick a canned reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    /// First structured request for the requirements payload.
    Finalize,
    /// The single bounded repair attempt.
    Repair,
    /// Pairwise semantic contradiction judgement.
    SemanticCheck,
}

impl fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finalize => write!(f, "finalize"),
            Self::Repair => write!(f, "repair"),
            Self::SemanticCheck => write!(f, "semantic_check"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One request to the model collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub purpose: CallPurpose,
    pub system: String,
    pub prompt: String,
    /// Declared JSON schema of the expected reply.
    pub schema: Value,
    pub settings: ModelSettings,
}

impl ModelRequest {
    /// Text the budget estimate is computed from.
    pub fn billable_text(&self) -> String {
        format!("{}\n{}", self.system, self.prompt)
    }
}

/// Raw reply from a client, before accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    /// Provider-reported usage; estimated by the gateway when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// The outbound model call contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Client name for logging (e.g. `"openai"`, `"stub"`).
    fn name(&self) -> &'static str;

    /// Issue one request. Must not retry internally.
    async fn send(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError>;
}

/// Gateway output for a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Latency of the successful attempt.
    pub latency_ms: u64,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Outcome of one attempt as recorded in the [`CallLedger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub purpose: CallPurpose,
    pub attempt: u32,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cost_alert: bool,
}

/// Every attempt made during one run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallLedger {
    pub records: Vec<CallRecord>,
}

impl CallLedger {
    pub fn push(&mut self, record: CallRecord) {
        self.records.push(record);
    }

    pub fn total_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for record in &self.records {
            total.add(&record.usage);
        }
        total
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.records.iter().map(|r| r.cost_usd).sum()
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.records.iter().map(|r| r.latency_ms).sum()
    }

    /// Attempts made for `purpose`.
    pub fn attempts_for(&self, purpose: CallPurpose) -> usize {
        self.records.iter().filter(|r| r.purpose == purpose).count()
    }

    pub fn any_cost_alert(&self) -> bool {
        self.records.iter().any(|r| r.cost_alert)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("budget refused call: {0}")]
    Budget(#[from] BudgetExceeded),

    #[error("{error} (after {attempts} attempt(s))")]
    Upstream { error: UpstreamError, attempts: u32 },

    #[error("call cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Diagnostic record for a run result.
    pub fn to_record(&self, stage: &str) -> ErrorRecord {
        match self {
            Self::Budget(e) => ErrorRecord::budget(stage, e),
            Self::Upstream { error, .. } => ErrorRecord::upstream(stage, error),
            Self::Cancelled => ErrorRecord::cancelled(stage, "cancelled during model call"),
        }
    }
}

/// Budget- and retry-aware wrapper around a [`ModelClient`].
pub struct ModelGateway {
    client: Arc<dyn ModelClient>,
    budget: Arc<BudgetGuard>,
    retry: RetryPolicy,
    call_timeout: Duration,
    estimator: Arc<dyn TokenEstimator>,
}

impl ModelGateway {
    pub fn new(
        client: Arc<dyn ModelClient>,
        budget: Arc<BudgetGuard>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            budget,
            retry,
            call_timeout,
            estimator: Arc::new(CharCountEstimator::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    /// Estimated input tokens for `request`.
    pub fn estimate_input(&self, request: &ModelRequest) -> u64 {
        self.estimator.estimate(&request.billable_text())
    }

    /// Make one logical call: reserve, send, commit, retry transient failures.
    pub async fn call(
        &self,
        request: &ModelRequest,
        ledger: &mut CallLedger,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, GatewayError> {
        let estimated_input = self.estimate_input(request);
        let pricing = self.budget.config().pricing;
        let mut retries_made: u32 = 0;

        loop {
            let attempt = retries_made + 1;
            let reservation = self.budget.check_and_reserve(estimated_input)?;

            let started = Instant::now();
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(self.call_timeout, self.client.send(request)) => Some(r),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let result = match sent {
                None => {
                    reservation.release();
                    info!(purpose = %request.purpose, attempt, "model call cancelled");
                    return Err(GatewayError::Cancelled);
                }
                Some(Err(_elapsed)) => Err(UpstreamError::timeout(format!(
                    "no response within {}ms",
                    self.call_timeout.as_millis()
                ))),
                Some(Ok(r)) => r,
            };

            match result {
                Ok(reply) => {
                    let usage = reply.usage.unwrap_or_else(|| {
                        TokenUsage::new(estimated_input, self.estimator.estimate(&reply.text))
                    });
                    let cost_usd = pricing.cost_usd(&usage);
                    let committed = reservation.commit(&usage, cost_usd);
                    ledger.push(CallRecord {
                        purpose: request.purpose,
                        attempt,
                        usage,
                        cost_usd,
                        latency_ms,
                        ok: true,
                        error: None,
                        cost_alert: committed.cost_alert || committed.single_call_alert,
                    });
                    debug!(
                        purpose = %request.purpose,
                        attempt,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        latency_ms,
                        "model call succeeded"
                    );
                    return Ok(ModelResponse {
                        text: reply.text,
                        usage,
                        cost_usd,
                        latency_ms,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    // The provider may have billed a failed attempt.
                    let usage = err.usage.unwrap_or(TokenUsage::new(estimated_input, 0));
                    let cost_usd = pricing.cost_usd(&usage);
                    let committed = reservation.commit(&usage, cost_usd);
                    ledger.push(CallRecord {
                        purpose: request.purpose,
                        attempt,
                        usage,
                        cost_usd,
                        latency_ms,
                        ok: false,
                        error: Some(err.to_string()),
                        cost_alert: committed.cost_alert || committed.single_call_alert,
                    });

                    if !err.retryable || !self.retry.should_retry(retries_made) {
                        warn!(
                            purpose = %request.purpose,
                            attempt,
                            max_attempts = self.retry.max_attempts(),
                            kind = %err.kind,
                            retryable = err.retryable,
                            "model call failed"
                        );
                        return Err(GatewayError::Upstream {
                            error: err,
                            attempts: attempt,
                        });
                    }

                    retries_made += 1;
                    let delay = self.retry.backoff_duration(retries_made);
                    warn!(
                        purpose = %request.purpose,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        kind = %err.kind,
                        backoff_ms = delay.as_millis() as u64,
                        "transient model call failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
