//! Contradiction detection over clarified requirements.
//!
//! The deterministic half lives here: lexical rules ([`rules`]) and the
//! similarity heuristic that picks pairs for the model-backed semantic pass
//! ([`candidates`]). The semantic pass itself runs in the agent crate.

pub mod candidates;
pub mod rules;
pub mod text;

use serde::{Deserialize, Serialize};

pub use candidates::{select_candidate_pairs, CandidatePair, CandidatePrior};
pub use rules::{detect_rule_findings, ConceptRule, RuleSet};

use crate::requirements::{ContradictionFinding, Detector, Severity};

/// Counts by detector and severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub total: usize,
    pub blocking: usize,
    pub advisory: usize,
    pub rule: usize,
    pub semantic: usize,
}

impl FindingSummary {
    pub fn from_findings(findings: &[ContradictionFinding]) -> Self {
        findings.iter().fold(Self::default(), |mut acc, f| {
            acc.total += 1;
            match f.severity {
                Severity::Blocking => acc.blocking += 1,
                Severity::Advisory => acc.advisory += 1,
            }
            match f.detector {
                Detector::Rule => acc.rule += 1,
                Detector::Semantic => acc.semantic += 1,
            }
            acc
        })
    }
}

/// Merge semantic findings into rule findings, one finding per pair.
///
/// A semantic finding replaces a rule finding on the same pair only when it
/// is more severe. Output is ordered by pair.
pub fn merge_findings(
    rule: Vec<ContradictionFinding>,
    semantic: Vec<ContradictionFinding>,
) -> Vec<ContradictionFinding> {
    let mut merged: std::collections::BTreeMap<(usize, usize), ContradictionFinding> = rule
        .into_iter()
        .map(|f| (f.pair(), f))
        .collect();
    for finding in semantic {
        match merged.get(&finding.pair()) {
            Some(existing) if existing.severity >= finding.severity => {}
            _ => {
                merged.insert(finding.pair(), finding);
            }
        }
    }
    merged.into_values().collect()
}
