//! Deterministic offline client.
//!
//! Derives a schema-conformant payload from the user text embedded in the
//! prompt, so offline runs exercise the same validation, contradiction and
//! assumption stages as live ones. Semantic checks come back "no conflict"
//! for every pair. Usage is left to the gateway's estimator.

use std::sync::LazyLock;

use async_trait::async_trait;
use finalize_gates::UpstreamError;
use regex::Regex;
use serde_json::json;

use super::{CallPurpose, ModelClient, ModelReply, ModelRequest};
use crate::prompts;

static PAIR_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pair_id:\s*(p-\d+)").expect("PAIR_ID regex should compile"));

const TITLE_CHARS: usize = 80;
const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct StubClient;

impl StubClient {
    pub fn new() -> Self {
        Self
    }

    /// Payload the stub returns for `text`.
    pub fn payload_for(text: &str) -> serde_json::Value {
        let trimmed = text.trim();
        let mut requirements: Vec<String> = trimmed
            .split(['.', ';', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if requirements.is_empty() && !trimmed.is_empty() {
            requirements.push(trimmed.to_string());
        }
        json!({
            "title": trimmed.chars().take(TITLE_CHARS).collect::<String>(),
            "summary": trimmed.chars().take(SUMMARY_CHARS).collect::<String>(),
            "clarified_requirements": requirements,
            "assumptions": [],
            "open_questions": [],
        })
    }

    fn semantic_reply(prompt: &str) -> serde_json::Value {
        let verdicts: Vec<_> = PAIR_ID_RE
            .captures_iter(prompt)
            .map(|c| {
                json!({
                    "pair_id": &c[1],
                    "conflict": false,
                    "reason": "offline stub",
                    "confidence": 0.0,
                })
            })
            .collect();
        json!(verdicts)
    }
}

#[async_trait]
impl ModelClient for StubClient {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
        let body = match request.purpose {
            CallPurpose::SemanticCheck => Self::semantic_reply(&request.prompt),
            CallPurpose::Finalize | CallPurpose::Repair => {
                let text = prompts::extract_user_input(&request.prompt).unwrap_or_default();
                Self::payload_for(text)
            }
        };
        Ok(ModelReply {
            text: body.to_string(),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ModelSettings;

    fn request(purpose: CallPurpose, prompt: String) -> ModelRequest {
        ModelRequest {
            purpose,
            system: String::new(),
            prompt,
            schema: serde_json::Value::Null,
            settings: ModelSettings {
                model: "stub".into(),
                temperature: 0.0,
                max_tokens: 256,
            },
        }
    }

    #[test]
    fn test_payload_splits_sentences() {
        let payload = StubClient::payload_for("Build a todo CLI. Store tasks locally; support tags\n");
        let reqs = payload["clarified_requirements"].as_array().unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[1], "Store tasks locally");
        assert_eq!(payload["open_questions"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_payload_single_fragment() {
        let payload = StubClient::payload_for("Build a todo CLI");
        assert_eq!(payload["clarified_requirements"][0], "Build a todo CLI");
        assert_eq!(payload["summary"], "Build a todo CLI");
    }

    #[test]
    fn test_title_truncated() {
        let long = "x".repeat(300);
        let payload = StubClient::payload_for(&long);
        assert_eq!(payload["title"].as_str().unwrap().len(), 80);
        assert_eq!(payload["summary"].as_str().unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_finalize_reply_uses_embedded_input() {
        let prompt = prompts::finalize_prompt("Build a todo CLI. Sync to cloud", None);
        let reply = StubClient::new()
            .send(&request(CallPurpose::Finalize, prompt))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply.text).unwrap();
        assert_eq!(value["clarified_requirements"].as_array().unwrap().len(), 2);
        assert!(reply.usage.is_none());
    }

    #[tokio::test]
    async fn test_semantic_reply_clears_every_pair() {
        let prompt = "1) pair_id: p-0\nA: x\nB: y\n2) pair_id: p-1\nA: z\nB: w".to_string();
        let reply = StubClient::new()
            .send(&request(CallPurpose::SemanticCheck, prompt))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply.text).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["pair_id"], "p-1");
        assert_eq!(items[0]["conflict"], false);
    }
}
