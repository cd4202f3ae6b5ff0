//! OpenTelemetry-compatible span helpers for the finalize pipeline.
//!
//! All spans use dot-notation field names so a tracing-opentelemetry layer
//! can export them without renaming.
//!
//! # Span Hierarchy
//!
//! ```text
//! finalize.run                 (root, one per run_finalize call)
//!   ├─ finalize.model_call     (finalize / repair / semantic_check)
//!   ├─ finalize.validate       (first validation and repair validation)
//!   ├─ finalize.contradictions (rule pass + semantic pass)
//!   └─ finalize.assumptions    (auto-assumption resolution)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let span = otel::run_span(&request.trace_id, "gpt-5-nano");
//! // ... run the pipeline inside the span ...
//! otel::record_run_result(&span, "finalized", 2, 1450);
//! ```

use tracing::Span;

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_RUN: &str = "finalize.run";
pub const SPAN_MODEL_CALL: &str = "finalize.model_call";
pub const SPAN_VALIDATE: &str = "finalize.validate";
pub const SPAN_CONTRADICTIONS: &str = "finalize.contradictions";
pub const SPAN_ASSUMPTIONS: &str = "finalize.assumptions";

// ── Span Builders ────────────────────────────────────────────────────

/// Root span for one run.
///
/// Fields filled later via [`record_run_result`]: status, calls, duration.
pub fn run_span(trace_id: &str, model: &str) -> Span {
    tracing::info_span!(
        "finalize.run",
        "trace.id" = %trace_id,
        "finalize.model" = %model,
        "finalize.status" = tracing::field::Empty,
        "finalize.calls" = tracing::field::Empty,
        "finalize.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_run_result(span: &Span, status: &str, calls: usize, duration_ms: u64) {
    span.record("finalize.status", status);
    span.record("finalize.calls", calls as u64);
    span.record("finalize.duration_ms", duration_ms);
}

/// Span for one logical model call (retries included).
pub fn model_call_span(purpose: &str, client: &str) -> Span {
    tracing::info_span!(
        "finalize.model_call",
        "finalize.call.purpose" = %purpose,
        "finalize.client" = %client,
        "finalize.success" = tracing::field::Empty,
        "finalize.attempts" = tracing::field::Empty,
        "finalize.tokens_used" = tracing::field::Empty,
    )
}

pub fn record_model_call_result(span: &Span, success: bool, attempts: u32, tokens_used: u64) {
    span.record("finalize.success", success);
    span.record("finalize.attempts", attempts);
    span.record("finalize.tokens_used", tokens_used);
}

/// Span for a validation pass. `repair` is true for the repaired payload.
pub fn validate_span(repair: bool) -> Span {
    tracing::info_span!(
        "finalize.validate",
        "finalize.repair" = repair,
        "finalize.success" = tracing::field::Empty,
        "finalize.violation_count" = tracing::field::Empty,
    )
}

pub fn record_validate_result(span: &Span, success: bool, violation_count: usize) {
    span.record("finalize.success", success);
    span.record("finalize.violation_count", violation_count as u64);
}

pub fn contradictions_span(requirement_count: usize) -> Span {
    tracing::info_span!(
        "finalize.contradictions",
        "finalize.requirement_count" = requirement_count as u64,
        "finalize.blocking" = tracing::field::Empty,
        "finalize.advisory" = tracing::field::Empty,
        "finalize.semantic_status" = tracing::field::Empty,
    )
}

pub fn record_contradictions_result(
    span: &Span,
    blocking: usize,
    advisory: usize,
    semantic_status: &str,
) {
    span.record("finalize.blocking", blocking as u64);
    span.record("finalize.advisory", advisory as u64);
    span.record("finalize.semantic_status", semantic_status);
}

pub fn assumptions_span(question_count: usize) -> Span {
    tracing::info_span!(
        "finalize.assumptions",
        "finalize.question_count" = question_count as u64,
        "finalize.converted" = tracing::field::Empty,
        "finalize.remaining" = tracing::field::Empty,
    )
}

pub fn record_assumptions_result(span: &Span, converted: usize, remaining: usize) {
    span.record("finalize.converted", converted as u64);
    span.record("finalize.remaining", remaining as u64);
}
