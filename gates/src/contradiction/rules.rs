//! Rule-based contradiction pass. No external calls; O(n²) over requirements.
//!
//! Three rule families run over every pair:
//!
//! | Family    | Fires when                                                  | Severity |
//! |-----------|-------------------------------------------------------------|----------|
//! | concept   | one side matches a rule's `left` phrases, the other `right` | per rule |
//! | negation  | the other side covers ≥ `negation_overlap` of the forbidden clause | blocking |
//! | quantity  | same unit and subject, incompatible values                  | blocking if disjoint, else advisory |
//!
//! At most one finding is kept per pair; a blocking finding wins over an
//! advisory one, otherwise the first rule to fire wins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::text::{self, content_tokens, contains_phrase, coverage, tokenize};
use crate::requirements::{ClarifiedRequirement, ContradictionFinding, Detector, Severity};

/// Phrases that mark a requirement as forbidding something. `no` and
/// `without` count only at the start of a clause.
const NEGATION_PHRASES: &[&str] = &[
    "must not",
    "must never",
    "should not",
    "shall not",
    "will not",
    "may not",
    "cannot",
    "can not",
    "do not",
    "does not",
    "is not",
    "are not",
    "never",
    "is forbidden",
    "is prohibited",
    "are forbidden",
    "are prohibited",
];

/// Two mutually exclusive concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptRule {
    pub id: String,
    pub left: Vec<String>,
    pub right: Vec<String>,
    pub reason: String,
    #[serde(default = "blocking")]
    pub severity: Severity,
}

fn blocking() -> Severity {
    Severity::Blocking
}

impl ConceptRule {
    fn new(id: &str, left: &[&str], right: &[&str], reason: &str) -> Self {
        Self {
            id: id.to_string(),
            left: left.iter().map(|s| s.to_string()).collect(),
            right: right.iter().map(|s| s.to_string()).collect(),
            reason: reason.to_string(),
            severity: Severity::Blocking,
        }
    }
}

/// Configurable rule table and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub concepts: Vec<ConceptRule>,
    pub synonyms: BTreeMap<String, String>,
    pub negation_enabled: bool,
    /// Minimum share of the forbidden clause's content tokens that the other
    /// requirement must contain for a negation finding.
    pub negation_overlap: f64,
    pub quantity_enabled: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            concepts: vec![
                ConceptRule::new(
                    "stateless_vs_session",
                    &["stateless"],
                    &["session", "session state", "stateful"],
                    "one requirement calls for stateless behavior, the other relies on session state",
                ),
                ConceptRule::new(
                    "no_database_vs_persistence",
                    &["no database", "without a database", "without database"],
                    &["database", "persistence", "persistent", "persisted", "store data"],
                    "one requirement rules out a database, the other implies persistence or database usage",
                ),
                ConceptRule::new(
                    "single_user_vs_multi_tenant",
                    &["single user", "single tenant"],
                    &["multi tenant", "multi user"],
                    "single-user and multi-tenant deployment models are mutually exclusive",
                ),
                ConceptRule::new(
                    "offline_vs_external_api",
                    &["no external network", "no external access", "offline only", "no network access"],
                    &["external api", "third party api", "external service"],
                    "one requirement forbids external network access, the other needs an external API",
                ),
            ],
            synonyms: text::default_synonyms(),
            negation_enabled: true,
            negation_overlap: 0.75,
            quantity_enabled: true,
        }
    }
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.negation_overlap) || self.negation_overlap == 0.0 {
            return Err(format!(
                "negation_overlap must be in (0, 1], got {}",
                self.negation_overlap
            ));
        }
        for rule in &self.concepts {
            if rule.left.is_empty() || rule.right.is_empty() {
                return Err(format!("concept rule '{}' needs both sides", rule.id));
            }
        }
        Ok(())
    }

    /// Tokenize a phrase the same way requirement text is tokenized.
    fn phrase(&self, raw: &str) -> String {
        tokenize(raw, &self.synonyms).join(" ")
    }

    /// Content tokens of what a requirement forbids: the words after the
    /// first negation marker up to the end of its clause, or the words
    /// before a trailing marker (`plain text passwords are forbidden`).
    /// `None` when nothing is negated.
    fn forbidden_clause(&self, text: &str) -> Option<BTreeSet<String>> {
        text.split([',', ';', ':', '.']).find_map(|clause| {
            let tokens = tokenize(clause, &self.synonyms);
            let (start, len) = negation_marker(&tokens)?;
            let after = content_tokens(&tokens[start + len..]);
            if after.is_empty() {
                Some(content_tokens(&tokens[..start]))
            } else {
                Some(after)
            }
        })
    }

    pub(crate) fn prepare(&self, requirements: &[ClarifiedRequirement]) -> Vec<Prepared> {
        requirements
            .iter()
            .map(|req| {
                let tokens = tokenize(&req.text, &self.synonyms);
                let joined = tokens.join(" ");
                Prepared {
                    index: req.index,
                    content: content_tokens(&tokens),
                    quantities: parse_quantities(&req.text),
                    forbidden: self.forbidden_clause(&req.text),
                    joined,
                }
            })
            .collect()
    }
}

/// Per-requirement precomputation.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub index: usize,
    pub joined: String,
    pub content: BTreeSet<String>,
    pub forbidden: Option<BTreeSet<String>>,
    pub quantities: Vec<Quantity>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Bound {
    AtMost { strict: bool },
    AtLeast { strict: bool },
    Exactly,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Quantity {
    pub bound: Bound,
    pub value: f64,
    pub unit: String,
}

impl Quantity {
    fn describe(&self) -> String {
        let prefix = match self.bound {
            Bound::AtMost { strict: false } => "at most ",
            Bound::AtMost { strict: true } => "under ",
            Bound::AtLeast { strict: false } => "at least ",
            Bound::AtLeast { strict: true } => "over ",
            Bound::Exactly => "",
        };
        format!("{prefix}{} {}", self.value, self.unit)
    }
}

static BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(at most|no more than|up to|maximum of|max|under|less than|fewer than|at least|no less than|no fewer than|minimum of|min|more than|over)\s+(\d+(?:\.\d+)?)\s*(%|[a-z]+)",
    )
    .expect("BOUND_RE regex should compile")
});

static EXACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+(?:\.\d+)?)\s*(%|[a-z]+)").expect("EXACT_RE regex should compile")
});

fn canonical_unit(unit: &str) -> String {
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => "s".into(),
        "ms" | "millisecond" | "milliseconds" => "ms".into(),
        "min" | "mins" | "minute" | "minutes" => "min".into(),
        "h" | "hr" | "hrs" | "hour" | "hours" => "h".into(),
        "%" | "percent" => "%".into(),
        other => text::stem(other).to_string(),
    }
}

pub(crate) fn parse_quantities(raw: &str) -> Vec<Quantity> {
    let lowered = raw.to_lowercase();
    let mut spans = Vec::new();
    let mut out = Vec::new();

    for caps in BOUND_RE.captures_iter(&lowered) {
        let (Some(whole), Some(kw), Some(num), Some(unit)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let Ok(value) = num.as_str().parse::<f64>() else {
            continue;
        };
        let bound = match kw.as_str() {
            "under" | "less than" | "fewer than" => Bound::AtMost { strict: true },
            "more than" | "over" => Bound::AtLeast { strict: true },
            "at least" | "no less than" | "no fewer than" | "minimum of" | "min" => {
                Bound::AtLeast { strict: false }
            }
            _ => Bound::AtMost { strict: false },
        };
        spans.push(whole.range());
        out.push(Quantity {
            bound,
            value,
            unit: canonical_unit(unit.as_str()),
        });
    }

    for caps in EXACT_RE.captures_iter(&lowered) {
        let (Some(whole), Some(num), Some(unit)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        if spans
            .iter()
            .any(|s| whole.start() < s.end && s.start < whole.end())
        {
            continue;
        }
        let Ok(value) = num.as_str().parse::<f64>() else {
            continue;
        };
        out.push(Quantity {
            bound: Bound::Exactly,
            value,
            unit: canonical_unit(unit.as_str()),
        });
    }
    out
}

/// Whether two quantities on the same unit cannot both hold.
/// Returns `Some(true)` for disjoint ranges, `Some(false)` for a softer
/// mismatch, `None` when compatible.
fn quantity_conflict(a: &Quantity, b: &Quantity) -> Option<bool> {
    use Bound::*;
    match (a.bound, b.bound) {
        (AtMost { strict: su }, AtLeast { strict: sl }) => {
            let (upper, lower) = (a.value, b.value);
            (lower > upper || (lower == upper && (su || sl))).then_some(true)
        }
        (AtLeast { .. }, AtMost { .. }) => quantity_conflict(b, a),
        (Exactly, AtMost { strict }) => {
            (a.value > b.value || (strict && a.value == b.value)).then_some(true)
        }
        (Exactly, AtLeast { strict }) => {
            (a.value < b.value || (strict && a.value == b.value)).then_some(true)
        }
        (AtMost { .. } | AtLeast { .. }, Exactly) => quantity_conflict(b, a),
        (Exactly, Exactly) => (a.value != b.value).then_some(false),
        _ => None,
    }
}

fn shares_subject(a: &Prepared, b: &Prepared, unit: &str) -> bool {
    let strip = |set: &BTreeSet<String>| -> BTreeSet<String> {
        set.iter()
            .filter(|t| canonical_unit(t) != unit && !is_bound_word(t))
            .cloned()
            .collect()
    };
    let (ca, cb) = (strip(&a.content), strip(&b.content));
    if ca.is_empty() && cb.is_empty() {
        return true;
    }
    ca.intersection(&cb).next().is_some()
}

fn is_bound_word(token: &str) -> bool {
    matches!(
        token,
        "most" | "least" | "more" | "less" | "than" | "fewer" | "up" | "maximum"
            | "minimum" | "max" | "min" | "under" | "over"
    )
}

fn concept_match(rules: &RuleSet, rule: &ConceptRule, a: &Prepared, b: &Prepared) -> bool {
    let side = |p: &Prepared, phrases: &[String]| {
        phrases
            .iter()
            .any(|raw| contains_phrase(&p.joined, &rules.phrase(raw)))
    };
    let a_left = side(a, rule.left.as_slice());
    let b_left = side(b, rule.left.as_slice());
    // A text on the left side does not also count for the right side.
    let a_right = !a_left && side(a, rule.right.as_slice());
    let b_right = !b_left && side(b, rule.right.as_slice());
    (a_left && b_right) || (b_left && a_right)
}

/// Position and token length of the first negation marker in a clause.
fn negation_marker(tokens: &[String]) -> Option<(usize, usize)> {
    if tokens.first().is_some_and(|t| t == "no" || t == "without") {
        return Some((0, 1));
    }
    (0..tokens.len()).find_map(|start| {
        NEGATION_PHRASES.iter().find_map(|phrase| {
            let words: Vec<&str> = phrase.split(' ').collect();
            let matches = tokens.len() - start >= words.len()
                && words.iter().zip(&tokens[start..]).all(|(w, t)| *w == t);
            matches.then_some((start, words.len()))
        })
    })
}

fn negation_match(rules: &RuleSet, a: &Prepared, b: &Prepared) -> Option<String> {
    let (forbidden, other) = match (&a.forbidden, &b.forbidden) {
        (Some(f), None) => (f, b),
        (None, Some(f)) => (f, a),
        _ => return None,
    };
    if coverage(forbidden, &other.content) < rules.negation_overlap {
        return None;
    }
    let shared: Vec<&str> = forbidden
        .intersection(&other.content)
        .map(String::as_str)
        .collect();
    Some(format!(
        "one requirement forbids what the other requires ({})",
        shared.join(", ")
    ))
}

fn quantity_match(a: &Prepared, b: &Prepared) -> Option<(Severity, String)> {
    let mut soft = None;
    for qa in &a.quantities {
        for qb in b.quantities.iter().filter(|q| q.unit == qa.unit) {
            let Some(disjoint) = quantity_conflict(qa, qb) else {
                continue;
            };
            if !shares_subject(a, b, &qa.unit) {
                continue;
            }
            let reason = format!(
                "incompatible quantities: {} vs {}",
                qa.describe(),
                qb.describe()
            );
            if disjoint {
                return Some((Severity::Blocking, reason));
            }
            soft.get_or_insert((Severity::Advisory, reason));
        }
    }
    soft
}

/// Run every enabled rule over every pair of requirements.
pub fn detect_rule_findings(
    requirements: &[ClarifiedRequirement],
    rules: &RuleSet,
) -> Vec<ContradictionFinding> {
    let prepared = rules.prepare(requirements);
    let mut by_pair: BTreeMap<(usize, usize), ContradictionFinding> = BTreeMap::new();

    let mut record = |finding: ContradictionFinding| {
        let key = finding.pair();
        match by_pair.get(&key) {
            Some(existing) if existing.severity >= finding.severity => {}
            _ => {
                by_pair.insert(key, finding);
            }
        }
    };

    for (i, a) in prepared.iter().enumerate() {
        for b in &prepared[i + 1..] {
            let (lo, hi) = if a.index <= b.index { (a, b) } else { (b, a) };
            let finding = |reason: String, severity: Severity, rule_id: &str| ContradictionFinding {
                index_a: lo.index,
                index_b: hi.index,
                reason,
                detector: Detector::Rule,
                severity,
                rule_id: Some(rule_id.to_string()),
            };

            for rule in &rules.concepts {
                if concept_match(rules, rule, lo, hi) {
                    record(finding(rule.reason.clone(), rule.severity, &rule.id));
                }
            }
            if rules.negation_enabled {
                if let Some(reason) = negation_match(rules, lo, hi) {
                    record(finding(reason, Severity::Blocking, "negation"));
                }
            }
            if rules.quantity_enabled {
                if let Some((severity, reason)) = quantity_match(lo, hi) {
                    record(finding(reason, severity, "quantity"));
                }
            }
        }
    }

    let findings: Vec<ContradictionFinding> = by_pair.into_values().collect();
    debug!(
        requirements = requirements.len(),
        findings = findings.len(),
        "rule pass complete"
    );
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn detect(texts: &[&str]) -> Vec<ContradictionFinding> {
        detect_rule_findings(&reqs(texts), &RuleSet::default())
    }

    // ── Negation ──

    #[test]
    fn test_direct_negation_is_blocking() {
        let findings = detect(&[
            "The app must store data locally",
            "The app must not store data locally",
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pair(), (0, 1));
        assert_eq!(findings[0].severity, Severity::Blocking);
        assert_eq!(findings[0].rule_id.as_deref(), Some("negation"));
    }

    #[test]
    fn test_negation_with_contraction_and_plural() {
        let findings = detect(&["Send weekly summary emails", "It shouldn't send emails"]);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_unrelated_negation_not_flagged() {
        let findings = detect(&["Users can add todos", "Users cannot delete archived projects"]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_without_clause_is_not_negation() {
        let findings = detect(&["Users can add todos without an account", "Users can add todos"]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_negated_side_clause_not_covered_is_not_flagged() {
        let findings = detect(&[
            "Do not require an account to view todos",
            "Users can view todos",
        ]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_leading_without_is_negation() {
        let findings = detect(&[
            "Without encryption, store backups",
            "Backups require encryption",
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id.as_deref(), Some("negation"));
        assert!(findings[0].is_blocking());

        // Only the clause after `without` is forbidden.
        assert!(detect(&["Without encryption, store backups", "Store backups"]).is_empty());
    }

    #[test]
    fn test_trailing_marker_forbids_preceding_words() {
        let findings = detect(&[
            "Plain text passwords are forbidden",
            "Store plain text passwords for recovery",
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id.as_deref(), Some("negation"));
    }

    #[test]
    fn test_negation_can_be_disabled() {
        let rules = RuleSet {
            negation_enabled: false,
            ..RuleSet::default()
        };
        let findings = detect_rule_findings(
            &reqs(&["Cache results", "Do not cache results"]),
            &rules,
        );
        assert!(findings.is_empty());
    }

    // ── Concepts ──

    #[test]
    fn test_stateless_vs_sessions() {
        let findings = detect(&["The API is stateless", "Track user sessions for analytics"]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id.as_deref(), Some("stateless_vs_session"));
    }

    #[test]
    fn test_no_db_synonym_vs_persistence() {
        let findings = detect(&["No DB allowed", "Todos are persisted between runs"]);
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].rule_id.as_deref(),
            Some("no_database_vs_persistence")
        );
    }

    #[test]
    fn test_no_db_alone_does_not_self_conflict() {
        assert!(detect(&["No database", "Print a greeting"]).is_empty());
    }

    #[test]
    fn test_multitenant_spellings() {
        let a = detect(&["Single user desktop tool", "Multi-tenant billing"]);
        let b = detect(&["Single user desktop tool", "Multitenant billing"]);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_offline_vs_external_api() {
        let findings = detect(&[
            "Offline only operation",
            "Fetch rates from a third-party API",
        ]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_blocking());
    }

    #[test]
    fn test_custom_concept_rule() {
        let mut rules = RuleSet::default();
        rules.concepts.push(ConceptRule {
            id: "cli_vs_gui".into(),
            left: vec!["cli only".into()],
            right: vec!["gui".into()],
            reason: "interface mismatch".into(),
            severity: Severity::Advisory,
        });
        let findings =
            detect_rule_findings(&reqs(&["CLI only", "Ship a GUI installer"]), &rules);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Advisory);
    }

    // ── Quantities ──

    #[test]
    fn test_disjoint_bounds_are_blocking() {
        let findings = detect(&[
            "Support at most 10 concurrent users",
            "Support at least 50 concurrent users",
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Blocking);
        assert_eq!(findings[0].rule_id.as_deref(), Some("quantity"));
    }

    #[test]
    fn test_differing_exact_values_are_advisory() {
        let findings = detect(&["Retain logs for 30 days", "Retain logs for 90 days"]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Advisory);
    }

    #[test]
    fn test_compatible_bounds_not_flagged() {
        let findings = detect(&[
            "Respond in at most 2 seconds",
            "Respond in at least 1 second",
        ]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_quantities_on_different_subjects_not_flagged() {
        let findings = detect(&["Retain logs for 30 days", "Send reminders 2 days ahead"]);
        assert!(findings.is_empty());
        let findings = detect(&[
            "Respond within at most 2 seconds",
            "Cache entries for at least 30 seconds",
        ]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_parse_quantities_units() {
        let q = parse_quantities("Respond in under 200 ms, retry 3 times");
        assert_eq!(q.len(), 2);
        assert_eq!(q[0].bound, Bound::AtMost { strict: true });
        assert_eq!(q[0].unit, "ms");
        assert_eq!(q[1].bound, Bound::Exactly);
        assert_eq!(q[1].unit, "time");
    }

    // ── Pairing ──

    #[test]
    fn test_one_finding_per_pair_blocking_wins() {
        let findings = detect(&["No database", "Store data in a database"]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_blocking());
    }

    #[test]
    fn test_findings_ordered_by_pair() {
        let findings = detect(&[
            "The API is stateless",
            "Cache results",
            "Keep a login session",
            "Do not cache results",
        ]);
        let pairs: Vec<_> = findings.iter().map(|f| f.pair()).collect();
        assert_eq!(pairs, vec![(0, 2), (1, 3)]);
    }

    #[test]
    fn test_validate_rejects_bad_overlap() {
        let rules = RuleSet {
            negation_overlap: 1.5,
            ..RuleSet::default()
        };
        assert!(rules.validate().is_err());
        assert!(RuleSet::default().validate().is_ok());
    }
}
