//! Schema validation and the single bounded repair attempt.
//!
//! Validation itself lives in `finalize_gates::schema`; this module builds
//! the repair request and records what the repair did.
//!
//! Repair flow:
//! 1. First payload fails validation with violations `V`
//! 2. Re-send the original prompt plus `V` and the rejected output, asking
//!    for a corrected JSON-only payload
//! 3. Validate the repaired payload; a second failure ends the run

use finalize_gates::ValidationError;
use serde::{Deserialize, Serialize};

use crate::gateway::{CallPurpose, ModelRequest};

/// Longest slice of the rejected output echoed back to the model.
const REJECTED_EXCERPT_CHARS: usize = 2_000;

/// What happened in the repair stage of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairInfo {
    pub attempted: bool,
    pub succeeded: bool,
    /// Violations of the first payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    /// Violations of the repaired payload when the repair also failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining_violations: Vec<String>,
}

impl RepairInfo {
    pub fn started(err: &ValidationError) -> Self {
        Self {
            attempted: true,
            succeeded: false,
            violations: err.violations.clone(),
            remaining_violations: Vec::new(),
        }
    }
}

/// Original prompt followed by the violations and the rejected output.
pub fn build_repair_prompt(original_prompt: &str, err: &ValidationError, rejected: &str) -> String {
    let mut out = String::with_capacity(original_prompt.len() + 512);
    out.push_str(original_prompt);
    out.push_str("\n\nYour previous reply was rejected by the schema validator.\nViolations:\n");
    for violation in &err.violations {
        out.push_str("- ");
        out.push_str(violation);
        out.push('\n');
    }
    let excerpt: String = rejected.chars().take(REJECTED_EXCERPT_CHARS).collect();
    out.push_str("\nRejected reply:\n");
    out.push_str(&excerpt);
    out.push_str(
        "\n\nReturn a corrected payload that fixes every violation. \
Reply with the JSON object only.",
    );
    out
}

/// Repair request derived from the original request.
pub fn repair_request(original: &ModelRequest, err: &ValidationError, rejected: &str) -> ModelRequest {
    ModelRequest {
        purpose: CallPurpose::Repair,
        system: original.system.clone(),
        prompt: build_repair_prompt(&original.prompt, err, rejected),
        schema: original.schema.clone(),
        settings: original.settings.clone(),
    }
}
