//! Agent runtime for the library desk.
//!
//! A turn runs a bounded reason/act loop:
//! 1. **Transcript** (`conversation`): system prompt, prior history, the new message
//! 2. **Reasoning** (`llm`): the model answers or asks for tool invocations
//! 3. **Tool execution** (`tools`): invocations are parsed into [`tools::ToolCall`]
//!    and run against the store; results go back to the model
//! 4. **Reply** (`runtime`): the final answer plus an audit trail of every tool call
//!
//! The model never touches the database directly. Stock, prices and order totals are
//! computed by the store, and every tool failure is returned to the model as data.

pub mod conversation;
pub mod llm;
pub mod runtime;
pub mod tools;

pub use llm::{LlmClient, LlmError, OpenAiCompatibleClient};
pub use runtime::{AgentError, AgentReply, AgentRuntime, AgentSettings, TurnFailure};
pub use tools::{ToolCall, ToolExecutor, ToolOutcome};
