//! Prompt text for the finalize, repair and semantic-check calls.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever any template changes.
//! The version is stamped on every run result and telemetry record.

use serde_json::Value;

/// Prompt version. Bump on any template change.
pub const PROMPT_VERSION: &str = "1.2.0";

const INPUT_OPEN: &str = "<request>";
const INPUT_CLOSE: &str = "</request>";

/// System prompt for the finalize and repair calls.
pub const FINALIZE_SYSTEM: &str = "\
You turn a free-form product request into a structured requirements object.

Rules:
- Reply with a single JSON object and nothing else. No prose, no code fences.
- `summary`: one or two sentences describing what is being built.
- `clarified_requirements`: short, testable statements, one idea each, no duplicates.
- `assumptions`: details you are confident about that the user did not state. \
Each is {\"statement\", \"confidence\"} with confidence in [0, 1].
- `open_questions`: details you cannot decide. Each is {\"question\", \"confidence\", \
\"proposed_assumption\"}: `confidence` is how sure you are that `proposed_assumption` \
is what the user wants.
- Optional: `title`, `non_goals`, `constraints`, `dependencies`, `confidence`.
- Never invent requirements that contradict the request.";

/// System prompt for the pairwise semantic contradiction check.
pub const SEMANTIC_SYSTEM: &str = "\
You check pairs of software requirements for contradictions.

Two requirements conflict when no single system can satisfy both at once. \
Requirements that are merely related, overlapping or vague do not conflict.

Reply with a JSON array only, one item per pair, in the order given:
[{\"pair_id\": \"p-1\", \"conflict\": true|false, \"reason\": \"...\", \"confidence\": 0.0-1.0}]";

/// User prompt for the first finalize call. The request text is fenced so
/// the offline client can recover it.
pub fn finalize_prompt(text: &str, context: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        out.push_str("Prior context:\n");
        out.push_str(ctx.trim());
        out.push_str("\n\n");
    }
    out.push_str("Finalize the requirements for this request:\n");
    out.push_str(INPUT_OPEN);
    out.push('\n');
    out.push_str(text.trim());
    out.push('\n');
    out.push_str(INPUT_CLOSE);
    out
}

/// Recover the request text fenced by [`finalize_prompt`].
pub fn extract_user_input(prompt: &str) -> Option<&str> {
    let start = prompt.find(INPUT_OPEN)? + INPUT_OPEN.len();
    let end = start + prompt[start..].find(INPUT_CLOSE)?;
    Some(prompt[start..end].trim())
}

/// Append the declared schema to a system prompt.
pub fn with_schema(system: &str, schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_default();
    format!("{system}\n\nJSON schema of the reply:\n{rendered}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_round_trips_through_prompt() {
        let prompt = finalize_prompt("  Build a todo CLI  ", Some("existing team uses Rust"));
        assert!(prompt.starts_with("Prior context:"));
        assert_eq!(extract_user_input(&prompt), Some("Build a todo CLI"));
    }

    #[test]
    fn test_blank_context_omitted() {
        let prompt = finalize_prompt("x", Some("   "));
        assert!(!prompt.contains("Prior context"));
    }

    #[test]
    fn test_extract_without_fence() {
        assert_eq!(extract_user_input("no fence here"), None);
    }

    #[test]
    fn test_schema_appended() {
        let sys = with_schema("base", &serde_json::json!({"type": "object"}));
        assert!(sys.starts_with("base"));
        assert!(sys.contains("\"type\": \"object\""));
    }
}
