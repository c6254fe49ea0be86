//! LLM gateway + JSON response extraction for the MEDES pipeline.
//!
//! The gateway abstracts the serving-endpoint transport behind the
//! [`ChatModel`] trait so stage logic never touches HTTP details, and so
//! tests can substitute a scripted double.

use std::collections::VecDeque;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "medes-llm";

pub const DEFAULT_MODEL: &str = "databricks-meta-llama-3-3-70b-instruct";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing LLM configuration: {0}")]
    Config(&'static str),
    #[error("llm connection failed: {0}")]
    Transport(String),
    #[error("llm endpoint returned status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to parse JSON from LLM output (starts with {snippet:?}): {source}")]
    Parse {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("llm response contained no completion text")]
    EmptyCompletion,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Gateway configuration. Built explicitly and passed to the client
/// constructor; nothing in the crate reads hidden globals after that.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub host: String,
    pub token: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            // Slight temperature avoids repetition loops in long completions.
            temperature: 0.1,
        }
    }
}

impl LlmConfig {
    /// Recognized keys: `HOST`, `TOKEN`, `MODEL_NAME`. Missing host or token
    /// is surfaced by [`ServingEndpointClient::new`], not here.
    pub fn from_env() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_default(),
            token: env::var("TOKEN").unwrap_or_default(),
            model: env::var("MODEL_NAME").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            ..Default::default()
        }
    }
}

/// Completion capability consumed by the enrichment stages.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat client for a completion-style model serving endpoint.
#[derive(Debug)]
pub struct ServingEndpointClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl ServingEndpointClient {
    /// Fails fast when the endpoint identity or credential is absent.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.host.trim().is_empty() {
            return Err(LlmError::Config("HOST"));
        }
        if config.token.trim().is_empty() {
            return Err(LlmError::Config("TOKEN"));
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn invocation_url(&self) -> String {
        format!(
            "{}/serving-endpoints/{}/invocations",
            self.config.host.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl ChatModel for ServingEndpointClient {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            messages: [
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: prompt },
            ],
            max_tokens,
            temperature: self.config.temperature,
        };

        debug!(model = %self.config.model, max_tokens, "llm completion request");
        let response = self
            .http
            .post(self.invocation_url())
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status: status.as_u16(), body });
        }

        let completion: ChatResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(LlmError::EmptyCompletion)
    }
}

/// Extracts a single JSON object from raw model output, tolerating markdown
/// fencing and surrounding prose.
///
/// Span selection: a fenced block containing a `{...}` object wins, then the
/// first `{` through the last `}` of the whole text. One parse attempt on
/// the selected span; no repair of malformed JSON.
pub fn extract_json(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();
    let span = fenced_object(trimmed)
        .or_else(|| braced_object(trimmed))
        .unwrap_or(trimmed);
    serde_json::from_str(span).map_err(|source| LlmError::Parse {
        snippet: span.chars().take(50).collect(),
        source,
    })
}

fn fenced_object(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let inner = &after[..after.find("```")?];
    braced_object(inner)
}

fn braced_object(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    if open < close {
        Some(&text[open..=close])
    } else {
        None
    }
}

/// In-memory [`ChatModel`] that replays queued completions in order.
///
/// An exhausted queue answers with a transport error, which doubles as the
/// forced-failure path in stage fallback tests.
#[derive(Debug, Default)]
pub struct ScriptedChatModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedChatModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("scripted replies mutex poisoned")
            .push_back(reply.into());
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn generate(
        &self,
        _prompt: &str,
        _system_prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, LlmError> {
        self.replies
            .lock()
            .expect("scripted replies mutex poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::Transport("no scripted reply queued".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_from_tagged_fence() {
        let value = extract_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn extracts_object_from_untagged_fence_with_prose() {
        let text = "Sure, here you go:\n```\n{\"org\": {\"type\": \"clinic\"}}\n```\nThanks!";
        let value = extract_json(text).unwrap();
        assert_eq!(value, json!({"org": {"type": "clinic"}}));
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let value = extract_json("Here is the result: {\"a\": 1} Thanks!").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn non_json_text_is_a_parse_error_with_snippet() {
        let err = extract_json("not json at all").unwrap_err();
        match err {
            LlmError::Parse { snippet, .. } => assert_eq!(snippet, "not json at all"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_object_is_not_repaired() {
        let err = extract_json("{\"a\": 1,}").unwrap_err();
        assert!(matches!(err, LlmError::Parse { .. }));
    }

    #[test]
    fn fence_without_object_falls_back_to_whole_text_braces() {
        let text = "```\nnothing here\n```\nbut later {\"b\": 2} appears";
        let value = extract_json(text).unwrap();
        assert_eq!(value, json!({"b": 2}));
    }

    #[test]
    fn missing_host_or_token_fails_fast() {
        let err = ServingEndpointClient::new(LlmConfig {
            token: "secret".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, LlmError::Config("HOST")));

        let err = ServingEndpointClient::new(LlmConfig {
            host: "https://workspace.example".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, LlmError::Config("TOKEN")));
    }

    #[test]
    fn invocation_url_joins_host_and_model() {
        let client = ServingEndpointClient::new(LlmConfig {
            host: "https://workspace.example/".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.invocation_url(),
            format!("https://workspace.example/serving-endpoints/{DEFAULT_MODEL}/invocations")
        );
    }

    #[test]
    fn chat_request_serializes_to_endpoint_shape() {
        let request = ChatRequest {
            messages: [
                ChatMessage { role: "system", content: "Output ONLY valid JSON." },
                ChatMessage { role: "user", content: "hello" },
            ],
            max_tokens: 5,
            temperature: 0.1,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
        assert_eq!(value["max_tokens"], 5);
    }

    #[tokio::test]
    async fn scripted_model_replays_then_fails_with_transport() {
        let model = ScriptedChatModel::new(["{\"a\": 1}"]);
        model.push_reply("{\"b\": 2}");
        let first = model.generate("p", "s", 10).await.unwrap();
        assert_eq!(first, "{\"a\": 1}");
        let second = model.generate("p", "s", 10).await.unwrap();
        assert_eq!(second, "{\"b\": 2}");
        let err = model.generate("p", "s", 10).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
    }
}
