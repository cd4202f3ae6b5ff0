//! Finalize Gates
//!
//! Deterministic building blocks of the requirements-finalization pipeline.
//! Nothing in this crate performs I/O over the network or awaits; the agent
//! crate composes these gates around the model call.
//!
//! # Gates
//!
//! - `schema`: declared payload schema, structural validation, normalization
//! - `contradiction`: lexical contradiction rules and semantic candidate selection
//! - `assumptions`: confidence-gated conversion of open questions into assumptions
//! - `budget`: per-call ceiling, daily quota, cost alerts (with `ledger` persistence)
//! - `retry`: exponential backoff policy for transient upstream failures
//! - `estimate`: token estimators used before a call reaches the network
//! - `errors`: the shared error taxonomy

#![allow(clippy::uninlined_format_args)]

pub mod assumptions;
pub mod budget;
pub mod contradiction;
pub mod errors;
pub mod estimate;
pub mod ledger;
pub mod requirements;
pub mod retry;
pub mod schema;

// Re-export key data model types
pub use requirements::{
    Assumption, AssumptionSource, ClarifiedRequirement, ContradictionFinding, Detector,
    OpenQuestion, RawRequest, RequirementsObject, Severity,
};

// Re-export error taxonomy
pub use errors::{
    BudgetExceeded, ErrorKind, ErrorRecord, TelemetryError, UpstreamError, UpstreamErrorKind,
    ValidationError,
};

// Re-export budget types
pub use budget::{
    BudgetConfig, BudgetGuard, BudgetSnapshot, CommitOutcome, Pricing, Reservation, TokenUsage,
};
pub use ledger::{DayUsage, LedgerError, UsageLedger};

// Re-export gate entry points
pub use assumptions::{decide, resolve_assumptions, AutoAssumePolicy, Decision, Resolution};
pub use contradiction::{
    detect_rule_findings, merge_findings, select_candidate_pairs, CandidatePair, CandidatePrior,
    FindingSummary, RuleSet,
};
pub use estimate::{CharCountEstimator, TokenEstimator};
pub use retry::RetryPolicy;
pub use schema::{payload_schema, validate_payload, RequirementsPayload};
