//! Requirements data model shared by every stage of a run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// User input for one run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub trace_id: String,
}

impl RawRequest {
    /// New request with a fresh v4 trace id.
    pub fn new(text: impl Into<String>, context: Option<String>) -> Self {
        Self {
            text: text.into(),
            context,
            trace_id: new_trace_id(),
        }
    }

    pub fn with_trace_id(
        text: impl Into<String>,
        context: Option<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            context,
            trace_id: trace_id.into(),
        }
    }
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionSource {
    /// Converted from an open question by the auto-assumption engine.
    Auto,
    /// Stated by the model (or the user) directly.
    Explicit,
}

impl fmt::Display for AssumptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assumption {
    pub statement: String,
    pub confidence: f64,
    pub source: AssumptionSource,
}

/// An ambiguity the model could not settle.
///
/// `confidence` is the model's confidence in `proposed_assumption` (or in the
/// obvious default answer). Questions without a confidence are never
/// auto-assumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenQuestion {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_assumption: Option<String>,
}

impl OpenQuestion {
    pub fn plain(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            confidence: None,
            proposed_assumption: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifiedRequirement {
    /// Zero-based, stable for the lifetime of the run.
    pub index: usize,
    pub text: String,
}

/// The validated, normalized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementsObject {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub clarified_requirements: Vec<ClarifiedRequirement>,
    #[serde(default)]
    pub assumptions: Vec<Assumption>,
    #[serde(default)]
    pub open_questions: Vec<OpenQuestion>,
    #[serde(default)]
    pub non_goals: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl RequirementsObject {
    pub fn requirement_texts(&self) -> Vec<&str> {
        self.clarified_requirements
            .iter()
            .map(|r| r.text.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Rule,
    Semantic,
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule => write!(f, "rule"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advisory => write!(f, "advisory"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// A pair of clarified requirements that conflict. `index_a < index_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionFinding {
    pub index_a: usize,
    pub index_b: usize,
    pub reason: String,
    pub detector: Detector,
    pub severity: Severity,
    /// Rule that fired (rule detector) or `"semantic"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl ContradictionFinding {
    pub fn pair(&self) -> (usize, usize) {
        (self.index_a, self.index_b)
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}
