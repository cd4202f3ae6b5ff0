//! Auto-assumption engine: confidence-gated "assume vs. ask".
//!
//! Pure and deterministic. Each ambiguity maps to exactly one [`Decision`]:
//!
//! ```text
//!   enabled && confidence >= threshold  ──►  Assume(Assumption{source: auto})
//!   otherwise                            ──►  Ask(OpenQuestion unchanged)
//! ```
//!
//! Re-running [`resolve_assumptions`] on its own output changes nothing: the
//! assumptions it produced are already present (so they are not appended
//! again) and every remaining question already failed the gate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::requirements::{Assumption, AssumptionSource, OpenQuestion};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAssumePolicy {
    pub enabled: bool,
    pub confidence_threshold: f64,
}

impl Default for AutoAssumePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.6,
        }
    }
}

impl AutoAssumePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Assume(Assumption),
    Ask(OpenQuestion),
}

/// Decide one ambiguity.
pub fn decide(question: &OpenQuestion, policy: &AutoAssumePolicy) -> Decision {
    match question.confidence {
        Some(confidence) if policy.enabled && confidence >= policy.confidence_threshold => {
            let statement = question
                .proposed_assumption
                .clone()
                .unwrap_or_else(|| format!("Assumed: {}", question.question));
            Decision::Assume(Assumption {
                statement,
                confidence,
                source: AssumptionSource::Auto,
            })
        }
        _ => Decision::Ask(question.clone()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub assumptions: Vec<Assumption>,
    pub open_questions: Vec<OpenQuestion>,
    /// Number of questions converted on this pass.
    pub converted: usize,
}

/// Resolve every open question against `policy`, appending converted
/// assumptions after the existing ones. Duplicate statements are not added.
pub fn resolve_assumptions(
    assumptions: &[Assumption],
    open_questions: &[OpenQuestion],
    policy: &AutoAssumePolicy,
) -> Resolution {
    let mut seen: HashSet<String> = assumptions.iter().map(|a| a.statement.clone()).collect();
    let mut resolved = Resolution {
        assumptions: assumptions.to_vec(),
        ..Resolution::default()
    };

    for question in open_questions {
        match decide(question, policy) {
            Decision::Assume(assumption) => {
                resolved.converted += 1;
                if seen.insert(assumption.statement.clone()) {
                    resolved.assumptions.push(assumption);
                }
            }
            Decision::Ask(q) => resolved.open_questions.push(q),
        }
    }
    resolved
}
