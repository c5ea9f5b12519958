use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use bookdesk_core::config::{LlmConfig, LlmProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the transcript sent to the reasoning service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolInvocation>) -> Self {
        Self { role: ChatRole::Assistant, content, tool_calls: Some(calls), tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
        }
    }
}

/// `arguments` is the raw JSON text produced by the model; it is parsed at the tool boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolSchema {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// What the reasoning service decided for one step of a turn.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Answer(String),
    ToolCalls { content: Option<String>, calls: Vec<ToolInvocation> },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("could not reach the language model: {0}")]
    Transport(String),
    #[error("authentication with the language model failed; check llm.api_key")]
    Unauthorized,
    #[error("the language model rate limit was exceeded")]
    RateLimited,
    #[error("language model request failed ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("could not decode language model response: {0}")]
    Decode(String),
    #[error("language model returned no choices")]
    EmptyResponse,
    #[error("llm.api_key is required for provider `{0}`")]
    MissingApiKey(&'static str),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<Completion, LlmError>;
}

/// Client for any `/chat/completions` endpoint that speaks the OpenAI tool-calling dialect,
/// which covers both OpenAI and Ollama.
#[derive(Debug)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.provider == LlmProvider::OpenAi && config.api_key.is_none() {
            return Err(LlmError::MissingApiKey(config.provider.as_str()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.effective_base_url()),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSchema::to_wire).collect());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<Completion, LlmError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&self.request_body(messages, tools));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let text =
                    response.text().await.map_err(|error| LlmError::Transport(error.to_string()))?;
                parse_completion(&text)
            }
            StatusCode::UNAUTHORIZED => Err(LlmError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(LlmError::RateLimited),
            status => {
                let error_body: Option<Value> = response.json().await.ok();
                let message = error_body
                    .as_ref()
                    .and_then(|value| value.get("error").and_then(|error| error.get("message")))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                Err(LlmError::Api { status: status.as_u16(), message })
            }
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolInvocation>>,
}

fn parse_completion(body: &str) -> Result<Completion, LlmError> {
    let response: CompletionResponse =
        serde_json::from_str(body).map_err(|error| LlmError::Decode(error.to_string()))?;
    let choice = response.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;

    match choice.message.tool_calls {
        Some(calls) if !calls.is_empty() => {
            Ok(Completion::ToolCalls { content: choice.message.content, calls })
        }
        _ => Ok(Completion::Answer(choice.message.content.unwrap_or_default())),
    }
}
