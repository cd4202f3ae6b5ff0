//! OpenAI-compatible chat-completions client.
//!
//! Maps HTTP outcomes onto [`UpstreamError`]:
//!
//! | Outcome                    | Kind               | Retryable |
//! |----------------------------|--------------------|-----------|
//! | client-side timeout        | `timeout`          | yes       |
//! | 429                        | `rate_limited`     | yes       |
//! | 5xx / connection failure   | `provider_error`   | yes       |
//! | other 4xx                  | `provider_error`   | no        |
//! | unreadable envelope        | `invalid_response` | no        |

use std::time::Duration;

use async_trait::async_trait;
use finalize_gates::{TokenUsage, UpstreamError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ModelClient, ModelReply, ModelRequest};

pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiClient {
    /// `timeout` bounds each HTTP request; the gateway applies its own timeout on top.
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::provider(None, format!("http client init: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": request.settings.model,
            "temperature": request.settings.temperature,
            "max_tokens": request.settings.max_tokens,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        if request.schema.get("type").and_then(Value::as_str) == Some("object") {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

fn classify_send_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::timeout(err.to_string())
    } else {
        UpstreamError::provider(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

fn classify_status(status: u16, body: &str) -> UpstreamError {
    let snippet: String = body.chars().take(200).collect();
    if status == 429 {
        UpstreamError::rate_limited(format!("HTTP 429: {snippet}"))
    } else {
        UpstreamError::provider(Some(status), format!("HTTP {status}: {snippet}"))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %request.settings.model, purpose = %request.purpose, "sending chat completion");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_send_error)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }

        parse_completion(&text)
    }
}

fn parse_completion(text: &str) -> Result<ModelReply, UpstreamError> {
    let completion: ChatCompletion = serde_json::from_str(text)
        .map_err(|e| UpstreamError::invalid_response(format!("unreadable completion: {e}")))?;
    let usage = completion
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty());

    match content {
        Some(text) => Ok(ModelReply { text, usage }),
        None => {
            let err = UpstreamError::invalid_response("completion has no message content");
            Err(match usage {
                Some(u) => err.with_usage(u),
                None => err,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use finalize_gates::UpstreamErrorKind;

    use super::*;
    use crate::gateway::{CallPurpose, ModelSettings};

    #[test]
    fn test_parse_completion() {
        let reply = parse_completion(
            r#"{"choices":[{"message":{"content":"{\"summary\":\"x\"}"}}],
                "usage":{"prompt_tokens":12,"completion_tokens":4}}"#,
        )
        .unwrap();
        assert_eq!(reply.text, r#"{"summary":"x"}"#);
        assert_eq!(reply.usage, Some(TokenUsage::new(12, 4)));
    }

    #[test]
    fn test_empty_content_keeps_usage() {
        let err = parse_completion(
            r#"{"choices":[{"message":{"content":""}}],"usage":{"prompt_tokens":9,"completion_tokens":0}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::InvalidResponse);
        assert!(!err.retryable);
        assert_eq!(err.usage, Some(TokenUsage::new(9, 0)));
    }

    #[test]
    fn test_garbage_envelope() {
        let err = parse_completion("<html>").unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::InvalidResponse);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429, "").kind, UpstreamErrorKind::RateLimited);
        assert!(classify_status(503, "").retryable);
        assert!(!classify_status(401, "bad key").retryable);
    }

    #[test]
    fn test_body_requests_json_for_object_schema() {
        let request = ModelRequest {
            purpose: CallPurpose::Finalize,
            system: "s".into(),
            prompt: "p".into(),
            schema: json!({"type": "object"}),
            settings: ModelSettings {
                model: "gpt-5-nano".into(),
                temperature: 0.2,
                max_tokens: 64,
            },
        };
        let body = OpenAiClient::body(&request);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"], "p");

        let semantic = ModelRequest {
            schema: json!({"type": "array"}),
            ..request
        };
        assert!(OpenAiClient::body(&semantic).get("response_format").is_none());
    }
}
