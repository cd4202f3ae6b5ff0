//! Declared payload schema, structural validation and normalization.
//!
//! ```text
//!   raw text ─► extract_json_block ─► parse ─► check_structure ─► normalize
//!                    │                  │            │
//!                    └──────────────────┴────────────┴─► ValidationError{violations}
//! ```
//!
//! Structural checks walk the parsed value by hand so that every violation is
//! reported (with its path), not just the first one serde would trip over.
//! The list is what the repair prompt shows the model.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ValidationError;
use crate::requirements::{
    Assumption, AssumptionSource, ClarifiedRequirement, OpenQuestion, RequirementsObject,
};

/// Longest normalized string kept, in characters.
pub const MAX_FIELD_CHARS: usize = 200;
/// Length of a title derived from the summary.
pub const DERIVED_TITLE_CHARS: usize = 80;

/// The JSON payload the model is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequirementsPayload {
    #[schemars(description = "Short title; derived from the summary when omitted")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[schemars(description = "One or two sentence summary of what is being built")]
    pub summary: String,

    #[schemars(description = "Ordered, short, testable requirement statements (at least one)")]
    pub clarified_requirements: Vec<String>,

    #[schemars(description = "Assumptions made explicit by the author")]
    #[serde(default)]
    pub assumptions: Vec<PayloadAssumption>,

    #[schemars(
        description = "Unresolved ambiguities; attach confidence and proposed_assumption when a sensible default exists"
    )]
    #[serde(default)]
    pub open_questions: Vec<PayloadQuestion>,

    #[serde(default)]
    pub non_goals: Vec<String>,

    #[serde(default)]
    pub constraints: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[schemars(description = "Overall confidence in the payload, 0..1")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PayloadAssumption {
    Text(String),
    Detailed {
        statement: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PayloadQuestion {
    Text(String),
    Detailed {
        question: String,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        proposed_assumption: Option<String>,
    },
}

/// JSON schema for [`RequirementsPayload`], handed to the model call.
pub fn payload_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(RequirementsPayload)).unwrap_or_default()
}

/// Extract a JSON object from model text: a ```json fence if present, else
/// the span from the first `{` to the last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Validate raw model output and normalize it into a [`RequirementsObject`].
pub fn validate_payload(raw: &str, trace_id: &str) -> Result<RequirementsObject, ValidationError> {
    let Some(block) = extract_json_block(raw) else {
        return Err(ValidationError::single(
            "payload: no JSON object found in model output",
        ));
    };
    let value: Value = serde_json::from_str(block)
        .map_err(|e| ValidationError::single(format!("payload: malformed JSON: {e}")))?;

    let violations = check_structure(&value);
    if !violations.is_empty() {
        return Err(ValidationError::new(violations));
    }

    let payload: RequirementsPayload = serde_json::from_value(value)
        .map_err(|e| ValidationError::single(format!("payload: {e}")))?;
    Ok(normalize(payload, trace_id))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_confidence(path: &str, value: Option<&Value>, violations: &mut Vec<String>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) => match n.as_f64() {
            Some(c) if (0.0..=1.0).contains(&c) => {}
            _ => violations.push(format!("{path}: must be between 0 and 1, got {n}")),
        },
        Some(other) => violations.push(format!(
            "{path}: expected number, got {}",
            type_name(other)
        )),
    }
}

fn check_optional_string(path: &str, value: Option<&Value>, violations: &mut Vec<String>) {
    match value {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(other) => violations.push(format!(
            "{path}: expected string, got {}",
            type_name(other)
        )),
    }
}

fn check_string_list(field: &str, value: Option<&Value>, violations: &mut Vec<String>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    violations.push(format!(
                        "{field}[{i}]: expected string, got {}",
                        type_name(item)
                    ));
                }
            }
        }
        Some(other) => violations.push(format!(
            "{field}: expected array, got {}",
            type_name(other)
        )),
    }
}

/// Collect every structural violation in `value`.
pub fn check_structure(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(obj) = value.as_object() else {
        violations.push(format!(
            "payload: expected object, got {}",
            type_name(value)
        ));
        return violations;
    };

    match obj.get("summary") {
        None | Some(Value::Null) => violations.push("summary: required field missing".into()),
        Some(Value::String(s)) if s.trim().is_empty() => {
            violations.push("summary: must not be empty".into())
        }
        Some(Value::String(_)) => {}
        Some(other) => violations.push(format!(
            "summary: expected string, got {}",
            type_name(other)
        )),
    }

    match obj.get("clarified_requirements") {
        None | Some(Value::Null) => {
            violations.push("clarified_requirements: required field missing".into())
        }
        Some(Value::Array(items)) if items.is_empty() => {
            violations.push("clarified_requirements: must contain at least one entry".into())
        }
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) if s.trim().is_empty() => violations.push(format!(
                        "clarified_requirements[{i}]: must not be empty"
                    )),
                    Value::String(_) => {}
                    other => violations.push(format!(
                        "clarified_requirements[{i}]: expected string, got {}",
                        type_name(other)
                    )),
                }
            }
        }
        Some(other) => violations.push(format!(
            "clarified_requirements: expected array, got {}",
            type_name(other)
        )),
    }

    check_optional_string("title", obj.get("title"), &mut violations);
    check_confidence("confidence", obj.get("confidence"), &mut violations);
    for field in ["non_goals", "constraints", "dependencies"] {
        check_string_list(field, obj.get(field), &mut violations);
    }

    match obj.get("assumptions") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                let path = format!("assumptions[{i}]");
                match item {
                    Value::String(_) => {}
                    Value::Object(o) => {
                        if !o.get("statement").is_some_and(Value::is_string) {
                            violations.push(format!("{path}.statement: expected string"));
                        }
                        check_confidence(
                            &format!("{path}.confidence"),
                            o.get("confidence"),
                            &mut violations,
                        );
                    }
                    other => violations.push(format!(
                        "{path}: expected string or object, got {}",
                        type_name(other)
                    )),
                }
            }
        }
        Some(other) => violations.push(format!(
            "assumptions: expected array, got {}",
            type_name(other)
        )),
    }

    match obj.get("open_questions") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                let path = format!("open_questions[{i}]");
                match item {
                    Value::String(_) => {}
                    Value::Object(o) => {
                        if !o.get("question").is_some_and(Value::is_string) {
                            violations.push(format!("{path}.question: expected string"));
                        }
                        check_confidence(
                            &format!("{path}.confidence"),
                            o.get("confidence"),
                            &mut violations,
                        );
                        check_optional_string(
                            &format!("{path}.proposed_assumption"),
                            o.get("proposed_assumption"),
                            &mut violations,
                        );
                    }
                    other => violations.push(format!(
                        "{path}: expected string or object, got {}",
                        type_name(other)
                    )),
                }
            }
        }
        Some(other) => violations.push(format!(
            "open_questions: expected array, got {}",
            type_name(other)
        )),
    }

    violations
}

/// Trim and cap a string at `max` characters.
pub fn clip(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((byte_idx, _)) => trimmed[..byte_idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Clip every entry, drop empties and exact duplicates, keep first-seen order.
fn dedupe(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| clip(&s, MAX_FIELD_CHARS))
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn normalize(payload: RequirementsPayload, trace_id: &str) -> RequirementsObject {
    let summary = clip(&payload.summary, MAX_FIELD_CHARS);
    let title = payload
        .title
        .as_deref()
        .map(|t| clip(t, MAX_FIELD_CHARS))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| clip(&summary, DERIVED_TITLE_CHARS));

    let clarified_requirements = dedupe(payload.clarified_requirements)
        .into_iter()
        .enumerate()
        .map(|(index, text)| ClarifiedRequirement { index, text })
        .collect();

    let mut seen_statements = HashSet::new();
    let assumptions = payload
        .assumptions
        .into_iter()
        .map(|a| match a {
            PayloadAssumption::Text(statement) => (statement, None),
            PayloadAssumption::Detailed {
                statement,
                confidence,
            } => (statement, confidence),
        })
        .map(|(statement, confidence)| Assumption {
            statement: clip(&statement, MAX_FIELD_CHARS),
            confidence: confidence.unwrap_or(1.0),
            source: AssumptionSource::Explicit,
        })
        .filter(|a| !a.statement.is_empty() && seen_statements.insert(a.statement.clone()))
        .collect();

    let mut seen_questions = HashSet::new();
    let open_questions = payload
        .open_questions
        .into_iter()
        .map(|q| match q {
            PayloadQuestion::Text(question) => OpenQuestion::plain(clip(&question, MAX_FIELD_CHARS)),
            PayloadQuestion::Detailed {
                question,
                confidence,
                proposed_assumption,
            } => OpenQuestion {
                question: clip(&question, MAX_FIELD_CHARS),
                confidence,
                proposed_assumption: proposed_assumption
                    .map(|p| clip(&p, MAX_FIELD_CHARS))
                    .filter(|p| !p.is_empty()),
            },
        })
        .filter(|q| !q.question.is_empty() && seen_questions.insert(q.question.clone()))
        .collect();

    let mut object = RequirementsObject {
        id: String::new(),
        title,
        summary,
        clarified_requirements,
        assumptions,
        open_questions,
        non_goals: dedupe(payload.non_goals),
        constraints: dedupe(payload.constraints),
        dependencies: dedupe(payload.dependencies),
        confidence: payload.confidence,
    };
    object.id = requirements_id(&object, trace_id);
    object
}

/// Deterministic `req-<10 hex>` id over the canonical JSON (without `id`)
/// plus the trace id.
pub fn requirements_id(object: &RequirementsObject, trace_id: &str) -> String {
    let mut value = serde_json::to_value(object).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("id");
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(value.to_string().as_bytes());
    if !trace_id.is_empty() {
        hasher.update(b"|");
        hasher.update(trace_id.as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    format!("req-{}", &hex.as_str()[..10])
}
