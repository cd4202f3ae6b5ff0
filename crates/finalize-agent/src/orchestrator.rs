//! Orchestrator: composes the gateway, validator, contradiction detector and
//! assumption engine into `run_finalize`, driven by the [`StateMachine`].
//!
//! ```text
//!  RECEIVED ─► CALLING_MODEL ─► VALIDATING ─┬────────────────► CHECKING_CONTRADICTIONS
//!                   │               │       └─► REPAIRING ──┘          │
//!                   ▼               ▼             ▼                    ▼
//!                 FAILED          (never)       FAILED        RESOLVING_ASSUMPTIONS
//!                                                                      │
//!                                              FINALIZED ◄─────────────┴────► NEEDS_HUMAN_REVIEW
//! ```
//!
//! Every run returns exactly one [`FinalizeResult`], whatever happens. After
//! the terminal state the result is written to the artifact store (failures
//! logged only) and one telemetry record is handed to a tracked background
//! task, so a slow sink never delays the return path.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use finalize_gates::schema::requirements_id;
use finalize_gates::{
    payload_schema, resolve_assumptions, validate_payload, BudgetGuard, ContradictionFinding,
    ErrorRecord, FindingSummary, RawRequest, RequirementsObject,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn, Instrument};

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::config::{ConfigError, FinalizeConfig, Provider};
use crate::contradiction::{ContradictionDetector, SemanticPassReport, SemanticStatus};
use crate::gateway::openai::OpenAiClient;
use crate::gateway::stub::StubClient;
use crate::gateway::{
    CallLedger, CallPurpose, GatewayError, ModelClient, ModelGateway, ModelRequest,
    ModelResponse, ModelSettings,
};
use crate::otel;
use crate::prompts;
use crate::state_machine::{FinalizeState, StateMachine, TransitionRecord};
use crate::telemetry::{self, publish_best_effort, TelemetryRecord, TelemetrySink};
use crate::validator::{repair_request, RepairInfo};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    Finalized,
    NeedsHumanReview,
    Failed,
}

impl FinalizeStatus {
    /// Process exit code used by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Finalized => 0,
            Self::NeedsHumanReview => 2,
            Self::Failed => 1,
        }
    }

    fn from_state(state: FinalizeState) -> Self {
        match state {
            FinalizeState::Finalized => Self::Finalized,
            FinalizeState::NeedsHumanReview => Self::NeedsHumanReview,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for FinalizeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finalized => write!(f, "finalized"),
            Self::NeedsHumanReview => write!(f, "needs_human_review"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Usage aggregated over every attempt of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    /// Attempts across all purposes, retries included.
    pub calls: usize,
    pub repair_calls: usize,
    pub semantic_calls: usize,
    #[serde(default)]
    pub cost_alert: bool,
}

impl UsageTotals {
    pub fn from_ledger(ledger: &CallLedger) -> Self {
        let usage = ledger.total_usage();
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            cost_usd: ledger.total_cost_usd(),
            latency_ms: ledger.total_latency_ms(),
            calls: ledger.records.len(),
            repair_calls: ledger.attempts_for(CallPurpose::Repair),
            semantic_calls: ledger.attempts_for(CallPurpose::SemanticCheck),
            cost_alert: ledger.any_cost_alert(),
        }
    }
}

/// The terminal artifact of one run. Immutable after return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub trace_id: String,
    pub status: FinalizeStatus,
    pub requirements: Option<RequirementsObject>,
    pub findings: Vec<ContradictionFinding>,
    pub usage: UsageTotals,
    pub errors: Vec<ErrorRecord>,
    pub repair: RepairInfo,
    pub semantic: SemanticPassReport,
    /// Open questions converted into assumptions by this run.
    pub assumptions_converted: usize,
    pub transitions: Vec<TransitionRecord>,
    pub model: String,
    pub provider: String,
    pub prompt_version: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Non-fatal problems (artifact store failures).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl FinalizeResult {
    /// Empty `FAILED` result; the orchestrator fills it in as the run goes.
    pub fn failed_early(trace_id: &str, model: &str, provider: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            status: FinalizeStatus::Failed,
            requirements: None,
            findings: Vec::new(),
            usage: UsageTotals::default(),
            errors: Vec::new(),
            repair: RepairInfo::default(),
            semantic: SemanticPassReport::with_status(SemanticStatus::Disabled),
            assumptions_converted: 0,
            transitions: Vec::new(),
            model: model.to_string(),
            provider: provider.to_string(),
            prompt_version: prompts::PROMPT_VERSION.to_string(),
            started_at: Utc::now(),
            duration_ms: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn finding_summary(&self) -> FindingSummary {
        FindingSummary::from_findings(&self.findings)
    }
}

/// Mutable state of one run in progress.
struct Run {
    sm: StateMachine,
    ledger: CallLedger,
    result: FinalizeResult,
    raw_output: Option<String>,
    started: Instant,
}

impl Run {
    fn new(trace_id: &str, model: &str, provider: &str) -> Self {
        Self {
            sm: StateMachine::new(),
            ledger: CallLedger::default(),
            result: FinalizeResult::failed_early(trace_id, model, provider),
            raw_output: None,
            started: Instant::now(),
        }
    }

    fn stage(&self) -> &'static str {
        self.sm.current().as_str()
    }

    /// Advance, or fail the run if the edge is illegal. Returns false when
    /// the run is now failed.
    fn advance(&mut self, to: FinalizeState, reason: Option<&str>) -> bool {
        match self.sm.advance(to, reason) {
            Ok(()) => true,
            Err(e) => {
                self.fail(ErrorRecord::internal(self.stage(), e.to_string()));
                false
            }
        }
    }

    fn fail(&mut self, error: ErrorRecord) {
        let reason = error.message.clone();
        self.result.errors.push(error);
        self.result.requirements = None;
        if !self.sm.is_terminal() {
            // Legal from every non-terminal state.
            let _ = self.sm.fail(&reason);
        }
    }

    /// Fail with a cancellation error if `cancel` fired. Returns true when cancelled.
    fn cancelled(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            let stage = self.stage();
            self.fail(ErrorRecord::cancelled(stage, "cancellation requested"));
            return true;
        }
        false
    }

    fn gateway_failed(&mut self, err: &GatewayError) {
        let record = err.to_record(self.stage());
        self.fail(record);
    }
}

/// Runs finalize pipelines. Cheap to share behind an `Arc`; concurrent runs
/// share only the budget guard.
pub struct Orchestrator {
    config: FinalizeConfig,
    budget: Arc<BudgetGuard>,
    live: Option<Arc<dyn ModelClient>>,
    offline: Arc<dyn ModelClient>,
    telemetry: Arc<dyn TelemetrySink>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    telemetry_tasks: TaskTracker,
}

impl Orchestrator {
    /// Orchestrator over an explicit live client. Telemetry and artifacts
    /// follow `config`; override them with the `with_*` builders.
    pub fn new(
        config: FinalizeConfig,
        budget: Arc<BudgetGuard>,
        live: Option<Arc<dyn ModelClient>>,
    ) -> Self {
        let telemetry = telemetry::sink_from_config(&config);
        let artifacts: Option<Arc<dyn ArtifactStore>> = config
            .persist_artifacts
            .then(|| Arc::new(FsArtifactStore::new(&config.runs_dir)) as Arc<dyn ArtifactStore>);
        Self {
            config,
            budget,
            live,
            offline: Arc::new(StubClient::new()),
            telemetry,
            artifacts,
            telemetry_tasks: TaskTracker::new(),
        }
    }

    /// Everything from configuration: ledger-backed budget, provider client.
    pub fn from_config(config: FinalizeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let budget = Arc::new(BudgetGuard::with_ledger(
            config.budget.clone(),
            config.ledger_path(),
        ));
        let live: Option<Arc<dyn ModelClient>> = match config.model.provider {
            Provider::Mock => Some(Arc::new(StubClient::new())),
            Provider::Openai => match &config.model.api_key {
                Some(key) => {
                    let client = OpenAiClient::new(
                        config.model.api_base.clone(),
                        key.clone(),
                        config.model.call_timeout(),
                    )
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                    Some(Arc::new(client))
                }
                None => {
                    warn!("no API key configured; only offline runs are available");
                    None
                }
            },
        };
        Ok(Self::new(config, budget, live))
    }

    pub fn with_offline_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.offline = client;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_artifact_store(mut self, store: Option<Arc<dyn ArtifactStore>>) -> Self {
        self.artifacts = store;
        self
    }

    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    /// Run the pipeline over `raw_text`. `use_llm = false` forces the
    /// offline client.
    pub async fn run_finalize(
        &self,
        raw_text: &str,
        use_llm: bool,
        context: Option<&str>,
    ) -> FinalizeResult {
        let request = RawRequest::new(raw_text, context.map(String::from));
        self.run_finalize_with_cancel(&request, use_llm, &CancellationToken::new())
            .await
    }

    /// Run with caller-controlled cancellation. A cancelled run abandons
    /// the remaining stages and returns `FAILED`; any budget reservation is
    /// released.
    pub async fn run_finalize_with_cancel(
        &self,
        request: &RawRequest,
        use_llm: bool,
        cancel: &CancellationToken,
    ) -> FinalizeResult {
        let span = otel::run_span(&request.trace_id, &self.config.model.model);
        let result = self
            .run_inner(request, use_llm, cancel)
            .instrument(span.clone())
            .await;
        otel::record_run_result(
            &span,
            &result.status.to_string(),
            result.usage.calls,
            result.duration_ms,
        );
        result
    }

    /// Wait for in-flight telemetry publishes (each bounded by the telemetry
    /// timeout).
    pub async fn flush_telemetry(&self) {
        self.telemetry_tasks.close();
        self.telemetry_tasks.wait().await;
        self.telemetry_tasks.reopen();
    }

    fn settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.config.model.model.clone(),
            temperature: self.config.model.temperature,
            max_tokens: self.config.model.max_output_tokens,
        }
    }

    async fn run_inner(
        &self,
        request: &RawRequest,
        use_llm: bool,
        cancel: &CancellationToken,
    ) -> FinalizeResult {
        let client = if use_llm {
            self.live.clone()
        } else {
            Some(Arc::clone(&self.offline))
        };
        let provider = client.as_ref().map_or("none", |c| c.name());
        let mut run = Run::new(&request.trace_id, &self.config.model.model, provider);
        info!(trace_id = %request.trace_id, provider, use_llm, "finalize run started");

        let Some(client) = client else {
            run.fail(ErrorRecord::internal(
                run.stage(),
                "no live model client configured (missing API key?)",
            ));
            return self.finish(request, run);
        };
        let gateway = ModelGateway::new(
            client,
            Arc::clone(&self.budget),
            self.config.retry.clone(),
            self.config.model.call_timeout(),
        );

        if let Some(requirements) = self.produce_requirements(&gateway, request, &mut run, cancel).await {
            self.review_requirements(&gateway, request, requirements, &mut run, cancel)
                .await;
        }
        self.finish(request, run)
    }

    async fn model_call(
        &self,
        gateway: &ModelGateway,
        request: &ModelRequest,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Option<ModelResponse> {
        let span = otel::model_call_span(&request.purpose.to_string(), gateway.client_name());
        let outcome = gateway
            .call(request, &mut run.ledger, cancel)
            .instrument(span.clone())
            .await;
        match outcome {
            Ok(response) => {
                otel::record_model_call_result(&span, true, response.attempts, response.usage.total());
                run.raw_output = Some(response.text.clone());
                Some(response)
            }
            Err(e) => {
                otel::record_model_call_result(&span, false, 0, 0);
                run.gateway_failed(&e);
                None
            }
        }
    }

    /// CALLING_MODEL → VALIDATING → (REPAIRING →) CHECKING_CONTRADICTIONS.
    async fn produce_requirements(
        &self,
        gateway: &ModelGateway,
        request: &RawRequest,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Option<RequirementsObject> {
        if !run.advance(FinalizeState::CallingModel, None) || run.cancelled(cancel) {
            return None;
        }

        let schema = payload_schema();
        let first_request = ModelRequest {
            purpose: CallPurpose::Finalize,
            system: prompts::with_schema(prompts::FINALIZE_SYSTEM, &schema),
            prompt: prompts::finalize_prompt(&request.text, request.context.as_deref()),
            schema,
            settings: self.settings(),
        };
        let first = self.model_call(gateway, &first_request, run, cancel).await?;

        if !run.advance(FinalizeState::Validating, None) {
            return None;
        }
        let span = otel::validate_span(false);
        let first_err = match span.in_scope(|| validate_payload(&first.text, &request.trace_id)) {
            Ok(requirements) => {
                otel::record_validate_result(&span, true, 0);
                return run
                    .advance(FinalizeState::CheckingContradictions, Some("schema valid"))
                    .then_some(requirements);
            }
            Err(e) => {
                otel::record_validate_result(&span, false, e.violations.len());
                e
            }
        };

        let reason = format!("{} violation(s)", first_err.violations.len());
        info!(trace_id = %request.trace_id, violations = first_err.violations.len(), "payload invalid, attempting repair");
        run.result.repair = RepairInfo::started(&first_err);
        if !run.advance(FinalizeState::Repairing, Some(&reason)) || run.cancelled(cancel) {
            return None;
        }

        let repair = repair_request(&first_request, &first_err, &first.text);
        let second = self.model_call(gateway, &repair, run, cancel).await?;

        let span = otel::validate_span(true);
        match span.in_scope(|| validate_payload(&second.text, &request.trace_id)) {
            Ok(requirements) => {
                otel::record_validate_result(&span, true, 0);
                run.result.repair.succeeded = true;
                if !run.advance(FinalizeState::CheckingContradictions, Some("repaired")) {
                    return None;
                }
                Some(requirements)
            }
            Err(e) => {
                otel::record_validate_result(&span, false, e.violations.len());
                warn!(trace_id = %request.trace_id, violations = e.violations.len(), "repaired payload still invalid");
                run.result.repair.remaining_violations = e.violations.clone();
                let stage = run.stage();
                run.fail(ErrorRecord::validation(stage, &e));
                None
            }
        }
    }

    /// CHECKING_CONTRADICTIONS → RESOLVING_ASSUMPTIONS → terminal.
    async fn review_requirements(
        &self,
        gateway: &ModelGateway,
        request: &RawRequest,
        mut requirements: RequirementsObject,
        run: &mut Run,
        cancel: &CancellationToken,
    ) {
        if run.cancelled(cancel) {
            return;
        }

        let span = otel::contradictions_span(requirements.clarified_requirements.len());
        let contradiction = &self.config.contradiction;
        let detector = if contradiction.semantic_enabled {
            ContradictionDetector::new(contradiction, gateway, self.settings())
        } else {
            ContradictionDetector::rules_only(contradiction)
        };
        let outcome = detector
            .detect(
                &requirements.clarified_requirements,
                request.context.as_deref(),
                &mut run.ledger,
                cancel,
            )
            .instrument(span.clone())
            .await;
        let summary = FindingSummary::from_findings(&outcome.findings);
        otel::record_contradictions_result(
            &span,
            summary.blocking,
            summary.advisory,
            &outcome.semantic.status.to_string(),
        );
        let has_blocking = outcome.has_blocking();
        run.result.findings = outcome.findings;
        run.result.semantic = outcome.semantic;

        if run.cancelled(cancel) || !run.advance(FinalizeState::ResolvingAssumptions, None) {
            return;
        }

        let span = otel::assumptions_span(requirements.open_questions.len());
        let resolution = span.in_scope(|| {
            resolve_assumptions(
                &requirements.assumptions,
                &requirements.open_questions,
                &self.config.assumptions,
            )
        });
        otel::record_assumptions_result(&span, resolution.converted, resolution.open_questions.len());
        requirements.assumptions = resolution.assumptions;
        requirements.open_questions = resolution.open_questions;
        requirements.id = requirements_id(&requirements, &request.trace_id);
        run.result.assumptions_converted = resolution.converted;

        let open = requirements.open_questions.len();
        let (to, reason) = match (has_blocking, open) {
            (false, 0) => (FinalizeState::Finalized, None),
            (true, 0) => (
                FinalizeState::NeedsHumanReview,
                Some("blocking contradiction".to_string()),
            ),
            (false, n) => (
                FinalizeState::NeedsHumanReview,
                Some(format!("{n} open question(s)")),
            ),
            (true, n) => (
                FinalizeState::NeedsHumanReview,
                Some(format!("blocking contradiction, {n} open question(s)")),
            ),
        };
        if run.advance(to, reason.as_deref()) {
            run.result.requirements = Some(requirements);
        }
    }

    /// Seal the result, persist it, and hand telemetry to the background.
    fn finish(&self, request: &RawRequest, run: Run) -> FinalizeResult {
        let Run {
            sm,
            ledger,
            mut result,
            raw_output,
            started,
        } = run;

        result.status = FinalizeStatus::from_state(sm.current());
        result.usage = UsageTotals::from_ledger(&ledger);
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            trace_id = %result.trace_id,
            status = %result.status,
            calls = result.usage.calls,
            total_tokens = result.usage.total_tokens,
            history = %sm.summary(),
            "finalize run finished"
        );
        result.transitions = sm.into_transitions();

        if let Some(store) = &self.artifacts {
            if let Err(e) = store.store_artifact(&result.trace_id, &result) {
                warn!(trace_id = %result.trace_id, error = %e, "failed to store run artifact");
                result.diagnostics.push(format!("artifact not stored: {e}"));
            }
        }

        let record = TelemetryRecord::build(
            request,
            &result,
            raw_output.as_deref(),
            &self.config.telemetry,
        );
        let sink = Arc::clone(&self.telemetry);
        let timeout = self.config.telemetry.timeout();
        self.telemetry_tasks.spawn(async move {
            publish_best_effort(sink.as_ref(), &record, timeout).await;
        });

        result
    }
}
