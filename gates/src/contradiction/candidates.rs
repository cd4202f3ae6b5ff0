//! Candidate pair selection for the semantic pass.
//!
//! Ordering: pairs the rule pass flagged as advisory come first (in finding
//! order), then every other pair whose content-token Jaccard similarity is at
//! least `similarity_threshold`, most similar first. Pairs the rule pass
//! already marked blocking are never re-sent. The list is cut at `max_pairs`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::rules::RuleSet;
use super::text::jaccard;
use crate::requirements::{ClarifiedRequirement, ContradictionFinding, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePrior {
    /// The rule pass raised an advisory finding on this pair.
    RuleAdvisory,
    /// Selected by lexical similarity alone.
    Similarity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub index_a: usize,
    pub index_b: usize,
    pub similarity: f64,
    pub prior: CandidatePrior,
}

pub fn select_candidate_pairs(
    requirements: &[ClarifiedRequirement],
    rule_findings: &[ContradictionFinding],
    rules: &RuleSet,
    similarity_threshold: f64,
    max_pairs: usize,
) -> Vec<CandidatePair> {
    if max_pairs == 0 || requirements.len() < 2 {
        return Vec::new();
    }

    let prepared = rules.prepare(requirements);
    let similarity = |a: usize, b: usize| -> f64 {
        let find = |idx: usize| prepared.iter().find(|p| p.index == idx);
        match (find(a), find(b)) {
            (Some(pa), Some(pb)) => jaccard(&pa.content, &pb.content),
            _ => 0.0,
        }
    };

    let mut taken: HashSet<(usize, usize)> = rule_findings
        .iter()
        .filter(|f| f.severity == Severity::Blocking)
        .map(ContradictionFinding::pair)
        .collect();

    let mut out = Vec::new();
    for finding in rule_findings
        .iter()
        .filter(|f| f.severity == Severity::Advisory)
    {
        if taken.insert(finding.pair()) {
            out.push(CandidatePair {
                index_a: finding.index_a,
                index_b: finding.index_b,
                similarity: similarity(finding.index_a, finding.index_b),
                prior: CandidatePrior::RuleAdvisory,
            });
        }
    }

    let mut scored = Vec::new();
    for (i, a) in prepared.iter().enumerate() {
        for b in &prepared[i + 1..] {
            let key = (a.index.min(b.index), a.index.max(b.index));
            if taken.contains(&key) {
                continue;
            }
            let score = jaccard(&a.content, &b.content);
            if score >= similarity_threshold && score > 0.0 {
                scored.push(CandidatePair {
                    index_a: key.0,
                    index_b: key.1,
                    similarity: score,
                    prior: CandidatePrior::Similarity,
                });
            }
        }
    }
    scored.sort_by(|x, y| {
        y.similarity
            .total_cmp(&x.similarity)
            .then(x.index_a.cmp(&y.index_a))
            .then(x.index_b.cmp(&y.index_b))
    });

    out.extend(scored);
    out.truncate(max_pairs);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contradiction::detect_rule_findings;

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

    #[test]
    fn test_similar_pairs_ranked_by_similarity() {
        let r = reqs(&[
            "Export todo list to csv",
            "Export todo list to json",
            "Import todo list from csv",
            "Colour output in terminal",
        ]);
        let pairs = select_candidate_pairs(&r, &[], &RuleSet::default(), 0.2, 10);
        assert!(!pairs.is_empty());
        assert_eq!((pairs[0].index_a, pairs[0].index_b), (0, 1));
        assert!(pairs.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(pairs.iter().all(|p| p.index_a != 3 && p.index_b != 3));
    }

    #[test]
    fn test_cap_is_respected() {
        let r = reqs(&[
            "Export todo list to csv",
            "Export todo list to json",
            "Export todo list to xml",
            "Export todo list to yaml",
        ]);
        let pairs = select_candidate_pairs(&r, &[], &RuleSet::default(), 0.0, 2);
        assert_eq!(pairs.len(), 2);
        assert!(select_candidate_pairs(&r, &[], &RuleSet::default(), 0.0, 0).is_empty());
    }

    #[test]
    fn test_advisory_first_blocking_excluded() {
        let rules = RuleSet::default();
        let r = reqs(&[
            "Retain logs for 30 days",
            "Retain logs for 90 days",
            "The app must store data locally",
            "The app must not store data locally",
        ]);
        let findings = detect_rule_findings(&r, &rules);
        let pairs = select_candidate_pairs(&r, &findings, &rules, 0.2, 10);
        assert_eq!(pairs[0].prior, CandidatePrior::RuleAdvisory);
        assert_eq!((pairs[0].index_a, pairs[0].index_b), (0, 1));
        assert!(pairs.iter().all(|p| (p.index_a, p.index_b) != (2, 3)));
        assert_eq!(
            pairs
                .iter()
                .filter(|p| (p.index_a, p.index_b) == (0, 1))
                .count(),
            1
        );
    }

    #[test]
    fn test_single_requirement_has_no_pairs() {
        let r = reqs(&["Only one"]);
        assert!(select_candidate_pairs(&r, &[], &RuleSet::default(), 0.0, 5).is_empty());
    }
}
