//! Finalize run state machine: explicit states and legal transition guards.
//!
//! Every run starts at `Received` and ends in exactly one of `Finalized`,
//! `NeedsHumanReview` or `Failed`. The orchestrator calls `advance()` to move
//! between stages; each call checks the edge against the transition table
//! and appends to the transition trail that ends up in the run result.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeState {
    /// Request accepted, nothing sent yet.
    Received,
    /// Waiting on the first model call (budget check, retries included).
    CallingModel,
    /// Structural validation of the first payload.
    Validating,
    /// One repair call plus validation of the repaired payload.
    Repairing,
    /// Rule pass, then the optional semantic pass.
    CheckingContradictions,
    /// Confidence-gated assumption filling.
    ResolvingAssumptions,
    /// Valid, no blocking contradictions, no open questions. Terminal.
    Finalized,
    /// Valid but needs a human: blocking pair or open questions remain. Terminal.
    NeedsHumanReview,
    /// No usable requirements object. Terminal.
    Failed,
}

impl FinalizeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::NeedsHumanReview | Self::Failed)
    }

    /// Stage label used in error records and span fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CallingModel => "calling_model",
            Self::Validating => "validating",
            Self::Repairing => "repairing",
            Self::CheckingContradictions => "checking_contradictions",
            Self::ResolvingAssumptions => "resolving_assumptions",
            Self::Finalized => "finalized",
            Self::NeedsHumanReview => "needs_human_review",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FinalizeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal transitions:
/// ```text
/// Received               → CallingModel
/// CallingModel           → Validating
/// Validating             → CheckingContradictions | Repairing
/// Repairing              → CheckingContradictions
/// CheckingContradictions → ResolvingAssumptions
/// ResolvingAssumptions   → Finalized | NeedsHumanReview
/// (any non-terminal)     → Failed
/// ```
fn is_legal_transition(from: FinalizeState, to: FinalizeState) -> bool {
    use FinalizeState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Received, CallingModel)
            | (CallingModel, Validating)
            | (Validating, CheckingContradictions)
            | (Validating, Repairing)
            | (Repairing, CheckingContradictions)
            | (CheckingContradictions, ResolvingAssumptions)
            | (ResolvingAssumptions, Finalized)
            | (ResolvingAssumptions, NeedsHumanReview)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: FinalizeState,
    pub to: FinalizeState,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("illegal state transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: FinalizeState,
    pub to: FinalizeState,
}

pub struct StateMachine {
    current: FinalizeState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: FinalizeState::Received,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> FinalizeState {
        self.current
    }

    /// Attempt to advance to the next state.
    pub fn advance(
        &mut self,
        to: FinalizeState,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(from = %self.current, to = %to, reason, "State transition");

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(FinalizeState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// One-line history, e.g. `received → finalized (12ms, 5 transitions)`.
    pub fn summary(&self) -> String {
        let states: Vec<&str> = self.transitions.iter().map(|t| t.to.as_str()).collect();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            FinalizeState::Received,
            self.current,
            self.elapsed_ms(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            out.push_str(&format!(" [{}]", states.join(" → ")));
        }
        out
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: FinalizeState) -> StateMachine {
        StateMachine {
            current: state,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), FinalizeState::Received);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = StateMachine::new();
        sm.advance(FinalizeState::CallingModel, None).unwrap();
        sm.advance(FinalizeState::Validating, None).unwrap();
        sm.advance(FinalizeState::CheckingContradictions, Some("schema ok"))
            .unwrap();
        sm.advance(FinalizeState::ResolvingAssumptions, None).unwrap();
        sm.advance(FinalizeState::Finalized, None).unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 5);
    }

    #[test]
    fn test_repair_path() {
        let mut sm = StateMachine::new();
        sm.advance(FinalizeState::CallingModel, None).unwrap();
        sm.advance(FinalizeState::Validating, None).unwrap();
        sm.advance(FinalizeState::Repairing, Some("2 violations"))
            .unwrap();
        sm.advance(FinalizeState::CheckingContradictions, None)
            .unwrap();
        sm.advance(FinalizeState::ResolvingAssumptions, None).unwrap();
        sm.advance(FinalizeState::NeedsHumanReview, Some("open questions"))
            .unwrap();
        assert_eq!(sm.current(), FinalizeState::NeedsHumanReview);
    }

    #[test]
    fn test_no_second_repair() {
        let mut sm = at(FinalizeState::Repairing);
        assert!(sm.advance(FinalizeState::Repairing, None).is_err());
        assert!(sm.advance(FinalizeState::Validating, None).is_err());
    }

    #[test]
    fn test_failure_from_any_non_terminal_state() {
        for state in [
            FinalizeState::Received,
            FinalizeState::CallingModel,
            FinalizeState::Validating,
            FinalizeState::Repairing,
            FinalizeState::CheckingContradictions,
            FinalizeState::ResolvingAssumptions,
        ] {
            let mut sm = at(state);
            assert!(sm.fail("test failure").is_ok());
            assert_eq!(sm.current(), FinalizeState::Failed);
        }
    }

    #[test]
    fn test_cannot_leave_terminal() {
        for state in [
            FinalizeState::Finalized,
            FinalizeState::NeedsHumanReview,
            FinalizeState::Failed,
        ] {
            let mut sm = at(state);
            let err = sm.fail("nope").unwrap_err();
            assert_eq!(err.from, state);
            assert!(sm.advance(FinalizeState::CallingModel, None).is_err());
        }
    }

    #[test]
    fn test_cannot_skip_validation() {
        let mut sm = StateMachine::new();
        sm.advance(FinalizeState::CallingModel, None).unwrap();
        let err = sm
            .advance(FinalizeState::CheckingContradictions, None)
            .unwrap_err();
        assert_eq!(err.from, FinalizeState::CallingModel);
        assert_eq!(
            err.to_string(),
            "illegal state transition: calling_model → checking_contradictions"
        );
    }

    #[test]
    fn test_transition_record_keeps_reason() {
        let mut sm = StateMachine::new();
        sm.advance(FinalizeState::CallingModel, Some("budget ok"))
            .unwrap();
        let record = &sm.transitions()[0];
        assert_eq!(record.from, FinalizeState::Received);
        assert_eq!(record.reason.as_deref(), Some("budget ok"));

        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["to"], "calling_model");
    }

    #[test]
    fn test_summary() {
        let mut sm = StateMachine::new();
        sm.advance(FinalizeState::CallingModel, None).unwrap();
        sm.fail("quota").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("failed"));
        assert!(summary.contains("2 transitions"));
    }
}
