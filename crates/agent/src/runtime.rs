use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use bookdesk_core::config::{AgentConfig, LlmConfig};
use bookdesk_core::domain::session::{Message, ToolCallRecord};
use bookdesk_core::errors::ApplicationError;

use crate::conversation::build_transcript;
use crate::llm::{ChatMessage, Completion, LlmClient, LlmError, ToolSchema};
use crate::tools::{tool_schemas, ToolExecutor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub request_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(agent: &AgentConfig, llm: &LlmConfig) -> Self {
        Self {
            max_iterations: agent.max_iterations.max(1),
            request_timeout: Duration::from_secs(llm.timeout_secs.max(1)),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_iterations: 10, request_timeout: Duration::from_secs(60) }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Upstream(#[from] LlmError),
    #[error("language model did not answer within {0:?}")]
    Timeout(Duration),
    #[error("agent stopped after {0} reasoning steps without a final answer")]
    IterationLimit(u32),
}

impl From<AgentError> for ApplicationError {
    fn from(value: AgentError) -> Self {
        ApplicationError::Upstream(value.to_string())
    }
}

/// A turn that ended without an answer. Tools that already ran stay listed so their
/// side effects can still be audited.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct TurnFailure {
    #[source]
    pub cause: AgentError,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl From<TurnFailure> for ApplicationError {
    fn from(value: TurnFailure) -> Self {
        value.cause.into()
    }
}

/// Final answer of a turn plus the audit trail of every tool the model invoked.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentReply {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: u32,
}

pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    tools: ToolExecutor,
    system_prompt: String,
    settings: AgentSettings,
    schemas: Vec<ToolSchema>,
}

impl AgentRuntime {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: ToolExecutor,
        system_prompt: impl Into<String>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            system_prompt: system_prompt.into(),
            settings,
            schemas: tool_schemas(),
        }
    }

    pub fn settings(&self) -> AgentSettings {
        self.settings
    }

    /// Runs the reason/act loop for one user message. `history` must not contain the
    /// message itself.
    pub async fn respond(
        &self,
        history: &[Message],
        user_message: &str,
    ) -> Result<AgentReply, TurnFailure> {
        let mut tool_calls = Vec::new();
        match self.reason(history, user_message, &mut tool_calls).await {
            Ok((answer, iterations)) => Ok(AgentReply { answer, tool_calls, iterations }),
            Err(cause) => Err(TurnFailure { cause, tool_calls }),
        }
    }

    async fn reason(
        &self,
        history: &[Message],
        user_message: &str,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> Result<(String, u32), AgentError> {
        let mut transcript = build_transcript(&self.system_prompt, history, user_message);

        for iteration in 1..=self.settings.max_iterations {
            let completion = tokio::time::timeout(
                self.settings.request_timeout,
                self.llm.complete(&transcript, &self.schemas),
            )
            .await
            .map_err(|_| AgentError::Timeout(self.settings.request_timeout))??;

            match completion {
                Completion::Answer(answer) => {
                    info!(
                        event_name = "agent.turn.answered",
                        iterations = iteration,
                        tool_calls = tool_calls.len(),
                        "agent produced a final answer"
                    );
                    return Ok((answer, iteration));
                }
                Completion::ToolCalls { content, calls } => {
                    debug!(
                        event_name = "agent.turn.tool_calls",
                        iteration,
                        count = calls.len(),
                        "model requested tool calls"
                    );
                    transcript.push(ChatMessage::assistant_tool_calls(content, calls.clone()));

                    for call in calls {
                        let outcome =
                            self.tools.dispatch(&call.function.name, &call.function.arguments).await;
                        transcript.push(ChatMessage::tool_result(
                            call.id.clone(),
                            outcome.payload.to_string(),
                        ));
                        tool_calls.push(outcome.record);
                    }
                }
            }
        }

        warn!(
            event_name = "agent.turn.iteration_limit",
            max_iterations = self.settings.max_iterations,
            "agent hit the iteration cap"
        );
        Err(AgentError::IterationLimit(self.settings.max_iterations))
    }
}
