//! Contradiction detection: the always-on rule pass plus the optional,
//! bounded semantic pass.
//!
//! ```text
//!   detect_rule_findings ──► rule findings ──┐
//!          │                                 ├─► merge_findings ──► findings
//!   select_candidate_pairs (≤ max_pairs)     │
//!          └─► SemanticChecker::check ───────┘   (failure ⇒ rule findings only)
//! ```
//!
//! The semantic pass never produces more findings than pairs it was sent,
//! and any failure (budget, upstream, unparseable reply) is recorded in the
//! [`SemanticPassReport`] rather than failing the run.

use finalize_gates::estimate::{CharCountEstimator, TokenEstimator};
use finalize_gates::schema::extract_json_block;
use finalize_gates::{
    detect_rule_findings, merge_findings, select_candidate_pairs, CandidatePair,
    ClarifiedRequirement, ContradictionFinding, Detector, Severity,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ContradictionConfig;
use crate::gateway::{CallLedger, CallPurpose, ModelGateway, ModelRequest, ModelSettings};
use crate::prompts;

/// Semantic confirmations at or above this confidence block the run.
pub const BLOCKING_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticStatus {
    /// Turned off by configuration or no model available.
    Disabled,
    /// Enabled, but no pair qualified as a candidate.
    NoCandidates,
    Completed,
    /// Budget refusal, upstream failure, cancellation or unparseable reply.
    Failed,
    /// The call cost more than the single-call alert; confirmations discarded.
    SkippedDueToCost,
}

impl std::fmt::Display for SemanticStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::NoCandidates => write!(f, "no_candidates"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::SkippedDueToCost => write!(f, "skipped_due_to_cost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticPassReport {
    pub status: SemanticStatus,
    pub pairs_checked: usize,
    pub confirmed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
}

impl SemanticPassReport {
    pub fn with_status(status: SemanticStatus) -> Self {
        Self {
            status,
            pairs_checked: 0,
            confirmed: 0,
            error: None,
            cost_usd: 0.0,
        }
    }

    fn failed(pairs: usize, error: impl Into<String>) -> Self {
        Self {
            pairs_checked: pairs,
            error: Some(error.into()),
            ..Self::with_status(SemanticStatus::Failed)
        }
    }
}

/// One item of the semantic check reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SemanticVerdict {
    pub pair_id: String,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Declared schema of the semantic check reply.
pub fn verdict_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Vec<SemanticVerdict>)).unwrap_or_default()
}

fn verdicts_from_value(value: Value) -> Result<Vec<SemanticVerdict>, String> {
    let items = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("results") {
            Some(results @ Value::Array(_)) => results,
            _ => return Err("reply object has no `results` array".to_string()),
        },
        other => return Err(format!("expected a JSON array, got {other}")),
    };
    serde_json::from_value(items).map_err(|e| format!("malformed verdict: {e}"))
}

/// Accepts a bare array, `{"results": [...]}`, or either embedded in prose
/// or a fenced block.
pub fn parse_verdicts(text: &str) -> Result<Vec<SemanticVerdict>, String> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return verdicts_from_value(value);
    }
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return verdicts_from_value(value);
            }
        }
    }
    if let Some(block) = extract_json_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return verdicts_from_value(value);
        }
    }
    Err("no JSON verdict array found in reply".to_string())
}

fn pair_id(position: usize) -> String {
    format!("p-{}", position + 1)
}

/// Truncate both sides of a pair so together they fit `budget` tokens. A
/// side that fits in half the budget leaves the rest to the other side.
fn fit_pair<'t>(
    estimator: &CharCountEstimator,
    a: &'t str,
    b: &'t str,
    budget: u64,
) -> (&'t str, &'t str) {
    let half = budget / 2;
    let (cost_a, cost_b) = (estimator.estimate(a), estimator.estimate(b));
    if cost_a + cost_b <= budget {
        (a, b)
    } else if cost_a <= half {
        (a, estimator.truncate_to_tokens(b, budget - cost_a))
    } else if cost_b <= half {
        (estimator.truncate_to_tokens(a, budget - cost_b), b)
    } else {
        (
            estimator.truncate_to_tokens(a, half),
            estimator.truncate_to_tokens(b, budget - half),
        )
    }
}

/// Prompt listing each pair with its id. The two texts of a pair share
/// `max_tokens_per_pair`.
pub fn build_semantic_prompt(
    requirements: &[ClarifiedRequirement],
    candidates: &[CandidatePair],
    context: Option<&str>,
    max_tokens_per_pair: u64,
) -> String {
    let estimator = CharCountEstimator::default();
    let text_of = |index: usize| {
        requirements
            .iter()
            .find(|r| r.index == index)
            .map_or("", |r| r.text.as_str())
    };

    let mut lines = Vec::with_capacity(candidates.len() * 4 + 3);
    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(ctx) => lines.push(format!("Context: {ctx}")),
        None => lines.push("Context: (not provided)".to_string()),
    }
    lines.push(String::new());
    lines.push("Pairs:".to_string());
    for (pos, pair) in candidates.iter().enumerate() {
        let (a, b) = fit_pair(
            &estimator,
            text_of(pair.index_a),
            text_of(pair.index_b),
            max_tokens_per_pair,
        );
        lines.push(format!("{}) pair_id: {}", pos + 1, pair_id(pos)));
        lines.push(format!("   A: \"{a}\""));
        lines.push(format!("   B: \"{b}\""));
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Model-backed pairwise contradiction judgement.
pub struct SemanticChecker<'a> {
    gateway: &'a ModelGateway,
    config: &'a ContradictionConfig,
    settings: ModelSettings,
    single_call_cost_alert_usd: Option<f64>,
}

impl<'a> SemanticChecker<'a> {
    pub fn new(
        gateway: &'a ModelGateway,
        config: &'a ContradictionConfig,
        settings: ModelSettings,
    ) -> Self {
        let single_call_cost_alert_usd = gateway.budget().config().single_call_cost_alert_usd;
        Self {
            gateway,
            config,
            settings,
            single_call_cost_alert_usd,
        }
    }

    /// Judge `candidates` (already capped at `max_pairs`). Never fails outward.
    pub async fn check(
        &self,
        requirements: &[ClarifiedRequirement],
        candidates: &[CandidatePair],
        context: Option<&str>,
        ledger: &mut CallLedger,
        cancel: &CancellationToken,
    ) -> (Vec<ContradictionFinding>, SemanticPassReport) {
        let candidates = &candidates[..candidates.len().min(self.config.max_pairs)];
        if candidates.is_empty() {
            return (
                Vec::new(),
                SemanticPassReport::with_status(SemanticStatus::NoCandidates),
            );
        }

        let output_budget = (self.config.max_tokens_per_pair * candidates.len() as u64)
            .min(u64::from(self.settings.max_tokens)) as u32;
        let request = ModelRequest {
            purpose: CallPurpose::SemanticCheck,
            system: prompts::SEMANTIC_SYSTEM.to_string(),
            prompt: build_semantic_prompt(
                requirements,
                candidates,
                context,
                self.config.max_tokens_per_pair,
            ),
            schema: verdict_schema(),
            settings: ModelSettings {
                temperature: 0.0,
                max_tokens: output_budget.max(1),
                ..self.settings.clone()
            },
        };

        let response = match self.gateway.call(&request, ledger, cancel).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, pairs = candidates.len(), "semantic contradiction pass failed");
                return (Vec::new(), SemanticPassReport::failed(candidates.len(), e.to_string()));
            }
        };

        if let Some(limit) = self.single_call_cost_alert_usd.filter(|l| *l > 0.0) {
            if response.cost_usd > limit {
                warn!(
                    cost_usd = response.cost_usd,
                    limit, "semantic pass over single-call cost alert, discarding"
                );
                return (
                    Vec::new(),
                    SemanticPassReport {
                        status: SemanticStatus::SkippedDueToCost,
                        pairs_checked: candidates.len(),
                        confirmed: 0,
                        error: None,
                        cost_usd: response.cost_usd,
                    },
                );
            }
        }

        let verdicts = match parse_verdicts(&response.text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "semantic reply unparseable");
                let mut report = SemanticPassReport::failed(candidates.len(), e);
                report.cost_usd = response.cost_usd;
                return (Vec::new(), report);
            }
        };

        let mut findings = Vec::new();
        for (pos, pair) in candidates.iter().enumerate() {
            let id = pair_id(pos);
            let Some(verdict) = verdicts.iter().find(|v| v.pair_id == id) else {
                continue;
            };
            if !verdict.conflict {
                continue;
            }
            let confidence = verdict.confidence.unwrap_or(0.0);
            let severity = if confidence >= BLOCKING_CONFIDENCE {
                Severity::Blocking
            } else {
                Severity::Advisory
            };
            let reason = if verdict.reason.trim().is_empty() {
                "model judged the pair contradictory".to_string()
            } else {
                verdict.reason.trim().to_string()
            };
            findings.push(ContradictionFinding {
                index_a: pair.index_a,
                index_b: pair.index_b,
                reason,
                detector: Detector::Semantic,
                severity,
                rule_id: Some("semantic".to_string()),
            });
        }

        debug!(
            pairs = candidates.len(),
            confirmed = findings.len(),
            "semantic contradiction pass completed"
        );
        let report = SemanticPassReport {
            status: SemanticStatus::Completed,
            pairs_checked: candidates.len(),
            confirmed: findings.len(),
            error: None,
            cost_usd: response.cost_usd,
        };
        (findings, report)
    }
}

/// Everything the contradiction stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionOutcome {
    pub findings: Vec<ContradictionFinding>,
    pub rule_findings: usize,
    pub candidates: Vec<CandidatePair>,
    pub semantic: SemanticPassReport,
}

impl ContradictionOutcome {
    pub fn has_blocking(&self) -> bool {
        self.findings.iter().any(ContradictionFinding::is_blocking)
    }
}

/// Runs the rule pass and, when enabled and a model is available, the
/// semantic pass.
pub struct ContradictionDetector<'a> {
    config: &'a ContradictionConfig,
    semantic: Option<SemanticChecker<'a>>,
}

impl<'a> ContradictionDetector<'a> {
    /// Rule pass only.
    pub fn rules_only(config: &'a ContradictionConfig) -> Self {
        Self {
            config,
            semantic: None,
        }
    }

    pub fn new(
        config: &'a ContradictionConfig,
        gateway: &'a ModelGateway,
        settings: ModelSettings,
    ) -> Self {
        let semantic = config
            .semantic_enabled
            .then(|| SemanticChecker::new(gateway, config, settings));
        Self { config, semantic }
    }

    pub async fn detect(
        &self,
        requirements: &[ClarifiedRequirement],
        context: Option<&str>,
        ledger: &mut CallLedger,
        cancel: &CancellationToken,
    ) -> ContradictionOutcome {
        let rule_findings = detect_rule_findings(requirements, &self.config.rules);
        let rule_count = rule_findings.len();

        let Some(checker) = &self.semantic else {
            return ContradictionOutcome {
                findings: rule_findings,
                rule_findings: rule_count,
                candidates: Vec::new(),
                semantic: SemanticPassReport::with_status(SemanticStatus::Disabled),
            };
        };

        let candidates = select_candidate_pairs(
            requirements,
            &rule_findings,
            &self.config.rules,
            self.config.similarity_threshold,
            self.config.max_pairs,
        );
        let (semantic_findings, report) = checker
            .check(requirements, &candidates, context, ledger, cancel)
            .await;

        info!(
            rule_findings = rule_count,
            candidates = candidates.len(),
            semantic_status = %report.status,
            semantic_confirmed = report.confirmed,
            "contradiction detection finished"
        );
        ContradictionOutcome {
            findings: merge_findings(rule_findings, semantic_findings),
            rule_findings: rule_count,
            candidates,
            semantic: report,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use finalize_gates::{
        BudgetConfig, BudgetGuard, CandidatePrior, Pricing, RetryPolicy, UpstreamError,
    };

    use super::*;
    use crate::gateway::{ModelClient, ModelReply};

    fn reqs(texts: &[&str]) -> Vec<ClarifiedRequirement> {
        texts
            .iter()
            .enumerate()
            .map(|(index, t)| ClarifiedRequirement {
                index,
                text: t.to_string(),
            })
            .collect()
    }

    struct Fixed {
        reply: Result<String, UpstreamError>,
        prompts: Mutex<Vec<String>>,
    }

    impl Fixed {
        fn new(reply: Result<&str, UpstreamError>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(String::from),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn send(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.reply.clone().map(|text| ModelReply {
                text,
                usage: Some(finalize_gates::TokenUsage::new(100, 20)),
            })
        }
    }

    fn gateway(client: Arc<dyn ModelClient>, budget: BudgetConfig) -> ModelGateway {
        ModelGateway::new(
            client,
            Arc::new(BudgetGuard::new(budget)),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
            Duration::from_secs(5),
        )
    }

    fn settings() -> ModelSettings {
        ModelSettings {
            model: "m".into(),
            temperature: 0.2,
            max_tokens: 1_024,
        }
    }

    fn candidate(a: usize, b: usize) -> CandidatePair {
        CandidatePair {
            index_a: a,
            index_b: b,
            similarity: 0.5,
            prior: CandidatePrior::Similarity,
        }
    }

    #[test]
    fn test_parse_bare_array() {
        let v = parse_verdicts(r#"[{"pair_id":"p-1","conflict":true,"reason":"x","confidence":0.9}]"#)
            .unwrap();
        assert_eq!(v.len(), 1);
        assert!(v[0].conflict);
    }

    #[test]
    fn test_parse_results_object() {
        let v = parse_verdicts(r#"{"results":[{"pair_id":"p-2","conflict":false}]}"#).unwrap();
        assert_eq!(v[0].pair_id, "p-2");
        assert_eq!(v[0].confidence, None);
    }

    #[test]
    fn test_parse_embedded_in_prose() {
        let text = "Sure! Here you go:\n```json\n[{\"pair_id\":\"p-1\",\"conflict\":true}]\n```\nDone.";
        assert_eq!(parse_verdicts(text).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_verdicts("I think they conflict").is_err());
        assert!(parse_verdicts(r#"{"answer": 1}"#).is_err());
        assert!(parse_verdicts("42").is_err());
    }

    #[test]
    fn test_prompt_truncates_and_numbers_pairs() {
        let long = "word ".repeat(200);
        let requirements = reqs(&["short one", &long, "third"]);
        let prompt = build_semantic_prompt(
            &requirements,
            &[candidate(0, 1), candidate(1, 2)],
            None,
            4,
        );
        assert!(prompt.starts_with("Context: (not provided)"));
        assert!(prompt.contains("1) pair_id: p-1"));
        assert!(prompt.contains("2) pair_id: p-2"));
        // 4 tokens per pair: two (8 chars) each when both sides overflow.
        assert!(prompt.contains("   A: \"short on\"\n   B: \"word wor\""));
        // "third" fits in its half and keeps it; the long side gets the rest.
        assert!(prompt.contains("   A: \"word wor\"\n   B: \"third\""));
    }

    #[test]
    fn test_pair_shares_one_budget() {
        let estimator = CharCountEstimator::default();
        let long_a = "alpha ".repeat(100);
        let long_b = "beta ".repeat(100);
        for budget in [1, 7, 10, 64] {
            let (a, b) = fit_pair(&estimator, &long_a, &long_b, budget);
            assert!(estimator.estimate(a) + estimator.estimate(b) <= budget);
            assert_eq!(estimator.estimate(a), budget / 2);
        }
        assert_eq!(fit_pair(&estimator, "tiny", "pair", 8), ("tiny", "pair"));
    }

    #[test]
    fn test_verdict_schema_is_array() {
        assert_eq!(verdict_schema()["type"], "array");
    }

    #[tokio::test]
    async fn test_confirmed_conflict_severity_from_confidence() {
        let client = Fixed::new(Ok(r#"[
            {"pair_id":"p-1","conflict":true,"reason":"incompatible storage","confidence":0.8},
            {"pair_id":"p-2","conflict":true,"reason":"maybe","confidence":0.3},
            {"pair_id":"p-9","conflict":true,"reason":"unknown pair","confidence":1.0}
        ]"#));
        let gw = gateway(client.clone(), BudgetConfig::default());
        let config = ContradictionConfig::default();
        let checker = SemanticChecker::new(&gw, &config, settings());
        let requirements = reqs(&["a", "b", "c"]);

        let mut ledger = CallLedger::default();
        let (findings, report) = checker
            .check(
                &requirements,
                &[candidate(0, 1), candidate(1, 2)],
                Some("ctx"),
                &mut ledger,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.status, SemanticStatus::Completed);
        assert_eq!(report.pairs_checked, 2);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Blocking);
        assert_eq!(findings[0].reason, "incompatible storage");
        assert_eq!(findings[1].severity, Severity::Advisory);
        assert_eq!(ledger.attempts_for(CallPurpose::SemanticCheck), 1);
        assert!(client.prompts.lock().unwrap()[0].starts_with("Context: ctx"));
    }

    #[tokio::test]
    async fn test_pairs_capped_at_max() {
        let client = Fixed::new(Ok("[]"));
        let gw = gateway(client.clone(), BudgetConfig::default());
        let config = ContradictionConfig {
            max_pairs: 1,
            ..ContradictionConfig::default()
        };
        let checker = SemanticChecker::new(&gw, &config, settings());
        let requirements = reqs(&["a", "b", "c"]);
        let (_, report) = checker
            .check(
                &requirements,
                &[candidate(0, 1), candidate(0, 2), candidate(1, 2)],
                None,
                &mut CallLedger::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.pairs_checked, 1);
        let prompt = client.prompts.lock().unwrap()[0].clone();
        assert!(!prompt.contains("p-2"));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported_not_raised() {
        let client = Fixed::new(Err(UpstreamError::provider(Some(400), "nope")));
        let gw = gateway(client, BudgetConfig::default());
        let config = ContradictionConfig::default();
        let checker = SemanticChecker::new(&gw, &config, settings());
        let (findings, report) = checker
            .check(
                &reqs(&["a", "b"]),
                &[candidate(0, 1)],
                None,
                &mut CallLedger::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(findings.is_empty());
        assert_eq!(report.status, SemanticStatus::Failed);
        assert!(report.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_expensive_pass_discarded() {
        let client = Fixed::new(Ok(r#"[{"pair_id":"p-1","conflict":true,"confidence":0.9}]"#));
        let budget = BudgetConfig {
            single_call_cost_alert_usd: Some(0.01),
            pricing: Pricing {
                input_per_mtokens: 1_000.0,
                output_per_mtokens: 1_000.0,
            },
            ..BudgetConfig::default()
        };
        let gw = gateway(client, budget);
        let config = ContradictionConfig::default();
        let checker = SemanticChecker::new(&gw, &config, settings());
        let (findings, report) = checker
            .check(
                &reqs(&["a", "b"]),
                &[candidate(0, 1)],
                None,
                &mut CallLedger::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(findings.is_empty());
        assert_eq!(report.status, SemanticStatus::SkippedDueToCost);
        assert!(report.cost_usd > 0.01);
    }

    #[tokio::test]
    async fn test_detector_keeps_rule_findings_on_semantic_failure() {
        let client = Fixed::new(Ok("not json at all"));
        let gw = gateway(client, BudgetConfig::default());
        let config = ContradictionConfig::default();
        let detector = ContradictionDetector::new(&config, &gw, settings());
        let requirements = reqs(&[
            "The service must be stateless",
            "The service keeps user sessions in memory",
            "Exports must be available as CSV files",
            "Exports must be available as PDF files",
        ]);
        let outcome = detector
            .detect(
                &requirements,
                None,
                &mut CallLedger::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.semantic.status, SemanticStatus::Failed);
        assert!(outcome.rule_findings >= 1);
        assert!(outcome.has_blocking());
        assert!(outcome
            .findings
            .iter()
            .all(|f| f.detector == Detector::Rule));
    }

    #[tokio::test]
    async fn test_rules_only_detector() {
        let config = ContradictionConfig::default();
        let detector = ContradictionDetector::rules_only(&config);
        let outcome = detector
            .detect(
                &reqs(&["Users must log in", "Users must not log in"]),
                None,
                &mut CallLedger::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.semantic.status, SemanticStatus::Disabled);
        assert_eq!(outcome.findings.len(), 1);
        assert!(outcome.has_blocking());
    }
}
