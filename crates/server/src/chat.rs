//! Chat HTTP surface.
//!
//! - `GET  /`                             service descriptor
//! - `POST /api/chat`                     run one turn for a session
//! - `POST /api/sessions/new`             create (or reuse) a session
//! - `GET  /api/sessions/{id}/messages`   full history of a session

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use bookdesk_agent::conversation::prior_history;
use bookdesk_agent::{AgentReply, AgentRuntime};
use bookdesk_core::domain::session::{Message, MessageRole, Session, SessionId, ToolCallRecord};
use bookdesk_core::errors::{ApplicationError, InterfaceError};
use bookdesk_db::LibraryStore;

#[derive(Clone)]
pub struct ChatState {
    service: Arc<ChatService>,
}

impl ChatState {
    pub fn new(service: ChatService) -> Self {
        Self { service: Arc::new(service) }
    }
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/", get(service_descriptor))
        .route("/api/chat", post(chat))
        .route("/api/sessions/new", post(new_session))
        .route("/api/sessions/{id}/messages", get(session_messages))
        .with_state(state)
}

/// Orchestrates one chat turn: session bookkeeping around an agent run.
pub struct ChatService {
    store: LibraryStore,
    agent: Arc<AgentRuntime>,
    history_limit: usize,
}

impl ChatService {
    pub fn new(store: LibraryStore, agent: Arc<AgentRuntime>, history_limit: usize) -> Self {
        Self { store, agent, history_limit }
    }

    pub async fn run_turn(
        &self,
        session_id: &SessionId,
        message: &str,
    ) -> Result<AgentReply, ApplicationError> {
        let sessions = self.store.sessions();
        sessions.ensure(session_id).await?;

        let current = sessions.append_message(session_id, MessageRole::User, message).await?;
        let recent = sessions.recent_messages(session_id, self.history_limit + 1).await?;
        let history = prior_history(&recent, current.id, self.history_limit);

        let reply = match self.agent.respond(&history, message).await {
            Ok(reply) => reply,
            Err(failure) => {
                let recorded = sessions.record_tool_calls(session_id, &failure.tool_calls).await;
                if let Err(error) = recorded {
                    warn!(
                        event_name = "chat.turn.audit_failed",
                        session_id = %session_id,
                        tool_calls = failure.tool_calls.len(),
                        error = %error,
                        "could not record tool calls of a failed turn"
                    );
                }
                return Err(failure.into());
            }
        };

        sessions.complete_turn(session_id, &reply.tool_calls, &reply.answer).await?;
        Ok(reply)
    }

    pub async fn open_session(
        &self,
        requested: Option<SessionId>,
    ) -> Result<Session, ApplicationError> {
        let id = requested.unwrap_or_else(SessionId::generate);
        Ok(self.store.sessions().ensure(&id).await?)
    }

    pub async fn history(&self, session_id: &SessionId) -> Result<SessionHistory, ApplicationError> {
        let sessions = self.store.sessions();
        let session = sessions
            .find(session_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("session `{session_id}` not found")))?;
        let messages = sessions.list_messages(session_id).await?;
        let tool_calls = sessions.list_tool_calls(session_id).await?;
        Ok(SessionHistory { session, messages, tool_calls })
    }
}

pub struct SessionHistory {
    pub session: Session,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message: String,
    pub role: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NewSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.0.clone(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

impl From<&Message> for MessageResponse {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            session_id: message.session_id.0.clone(),
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            created_at: message.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
    pub succeeded: bool,
}

impl From<&ToolCallRecord> for ToolCallResponse {
    fn from(record: &ToolCallRecord) -> Self {
        Self {
            tool_name: record.tool_name.clone(),
            arguments: record.arguments.clone(),
            result: record.result.clone(),
            succeeded: record.succeeded,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionHistoryResponse {
    pub session: SessionResponse,
    pub messages: Vec<MessageResponse>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallResponse>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
    pub correlation_id: String,
}

/// Maps an [`InterfaceError`] to an HTTP status and a JSON body.
pub struct ApiError(pub InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. }
            | InterfaceError::NotFound { correlation_id, .. }
            | InterfaceError::BadGateway { correlation_id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id, .. }
            | InterfaceError::Internal { correlation_id, .. } => correlation_id.clone(),
        };
        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            detail: self.0.message().to_string(),
            correlation_id,
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

fn status_for(error: &InterfaceError) -> StatusCode {
    match error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Echoes `session_id` back on a request that did not decode, when one is readable.
fn session_id_hint(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("session_id")?.as_str().map(|id| id.trim().to_string()))
        .unwrap_or_default()
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn service_descriptor() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "bookdesk",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "GET /health",
            "chat": "POST /api/chat",
            "new_session": "POST /api/sessions/new",
            "session_messages": "GET /api/sessions/{id}/messages",
        }
    }))
}

pub async fn chat(State(state): State<ChatState>, body: Bytes) -> (StatusCode, Json<ChatResponse>) {
    let correlation_id = correlation_id();
    let (session_id, message) = match serde_json::from_slice::<ChatRequest>(&body) {
        Ok(request) => (request.session_id.trim().to_string(), Ok(request.message)),
        Err(error) => (
            session_id_hint(&body),
            Err(ApplicationError::InvalidRequest(format!("invalid chat request: {error}"))),
        ),
    };

    let result = match message {
        Err(error) => Err(error),
        Ok(message) if session_id.is_empty() || message.trim().is_empty() => {
            Err(ApplicationError::InvalidRequest(
                "session_id and message must not be empty".to_string(),
            ))
        }
        Ok(message) => {
            info!(
                event_name = "chat.turn.start",
                correlation_id = %correlation_id,
                session_id = %session_id,
                "chat turn received"
            );
            state.service.run_turn(&SessionId(session_id.clone()), message.trim()).await
        }
    };

    match result {
        Ok(reply) => {
            info!(
                event_name = "chat.turn.completed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                tool_calls = reply.tool_calls.len(),
                "chat turn completed"
            );
            (
                StatusCode::OK,
                Json(ChatResponse {
                    session_id,
                    message: reply.answer,
                    role: MessageRole::Assistant.as_str().to_string(),
                    success: true,
                    error: None,
                }),
            )
        }
        Err(failure) => {
            let interface = failure.into_interface(correlation_id.clone());
            let status = status_for(&interface);
            if status.is_server_error() {
                error!(
                    event_name = "chat.turn.failed",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    error = %interface,
                    "chat turn failed"
                );
            } else {
                warn!(
                    event_name = "chat.turn.rejected",
                    correlation_id = %correlation_id,
                    error = %interface,
                    "chat request rejected"
                );
            }
            (
                status,
                Json(ChatResponse {
                    session_id,
                    message: format!("An error occurred: {}", interface.user_message()),
                    role: MessageRole::Assistant.as_str().to_string(),
                    success: false,
                    error: Some(interface.message().to_string()),
                }),
            )
        }
    }
}

pub async fn new_session(
    State(state): State<ChatState>,
    body: Bytes,
) -> Result<Json<SessionResponse>, ApiError> {
    let correlation_id = correlation_id();
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        NewSessionRequest::default()
    } else {
        serde_json::from_slice::<NewSessionRequest>(&body).map_err(|error| {
            ApiError(
                ApplicationError::InvalidRequest(format!("invalid session request: {error}"))
                    .into_interface(correlation_id.clone()),
            )
        })?
    };

    let requested = request
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(SessionId);

    let session = state
        .service
        .open_session(requested)
        .await
        .map_err(|error| ApiError(error.into_interface(correlation_id.clone())))?;

    info!(
        event_name = "chat.session.opened",
        correlation_id = %correlation_id,
        session_id = %session.id,
        "session ready"
    );
    Ok(Json(SessionResponse::from(&session)))
}

pub async fn session_messages(
    Path(id): Path<String>,
    State(state): State<ChatState>,
) -> Result<Json<SessionHistoryResponse>, ApiError> {
    let history = state
        .service
        .history(&SessionId(id))
        .await
        .map_err(|error| ApiError(error.into_interface(correlation_id())))?;

    Ok(Json(SessionHistoryResponse {
        session: SessionResponse::from(&history.session),
        messages: history.messages.iter().map(MessageResponse::from).collect(),
        tool_calls: history.tool_calls.iter().map(ToolCallResponse::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    use bookdesk_agent::llm::{ChatMessage, Completion, LlmClient, LlmError, ToolInvocation, ToolSchema};
    use bookdesk_agent::{AgentRuntime, AgentSettings, ToolExecutor};
    use bookdesk_core::domain::session::{MessageRole, SessionId};
    use bookdesk_db::{connect_with_settings, migrations, DbPool, LibrarySeed, LibraryStore};

    use super::{router, ChatResponse, ChatService, ChatState, SessionHistoryResponse, SessionResponse};

    struct ScriptedLlm {
        script: Mutex<VecDeque<Result<Completion, LlmError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(steps: Vec<Result<Completion, LlmError>>) -> Self {
            Self { script: Mutex::new(steps.into()), seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSchema],
        ) -> Result<Completion, LlmError> {
            self.seen.lock().expect("seen lock").push(messages.to_vec());
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    async fn app(steps: Vec<Result<Completion, LlmError>>) -> (Router, DbPool, Arc<ScriptedLlm>) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        LibrarySeed::load(&pool).await.expect("seed");

        let store = LibraryStore::new(pool.clone());
        let llm = Arc::new(ScriptedLlm::new(steps));
        let agent = AgentRuntime::new(
            llm.clone(),
            ToolExecutor::new(store.clone()),
            "system",
            AgentSettings::default(),
        );
        let service = ChatService::new(store, Arc::new(agent), 10);
        (router(ChatState::new(service)), pool, llm)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn chat_turn_runs_tools_and_persists_history() {
        let (app, pool, llm) = app(vec![
            Ok(Completion::ToolCalls {
                content: None,
                calls: vec![ToolInvocation::new(
                    "c1",
                    "restock_book",
                    r#"{"isbn":"978-0137081073","qty":7}"#,
                )],
            }),
            Ok(Completion::Answer("Restocked The Clean Coder to 10.".into())),
        ])
        .await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({ "session_id": "desk-1", "message": "restock clean coder by 7" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = read_json(response).await;
        assert!(body.success);
        assert_eq!(body.role, "assistant");
        assert_eq!(body.message, "Restocked The Clean Coder to 10.");

        let first_transcript = llm.seen.lock().expect("seen").first().cloned().expect("call");
        assert_eq!(first_transcript.len(), 2, "a new session sends no prior history");

        let stock: i64 =
            sqlx::query_scalar("SELECT stock FROM books WHERE isbn = '978-0137081073'")
                .fetch_one(&pool)
                .await
                .expect("stock");
        assert_eq!(stock, 10);

        let audit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tool_calls WHERE session_id = 'desk-1'")
            .fetch_one(&pool)
            .await
            .expect("audit");
        assert_eq!(audit, 1);

        let history = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/desk-1/messages")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(history.status(), StatusCode::OK);
        let history: SessionHistoryResponse = read_json(history).await;
        let roles: Vec<&str> = history.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
        assert_eq!(history.tool_calls.len(), 1);
        assert_eq!(history.tool_calls[0].tool_name, "restock_book");
        assert_eq!(history.tool_calls[0].result["new_stock"], 10);
    }

    #[tokio::test]
    async fn failed_turn_still_records_tools_that_ran() {
        let (app, pool, _llm) = app(vec![
            Ok(Completion::ToolCalls {
                content: None,
                calls: vec![ToolInvocation::new(
                    "c1",
                    "restock_book",
                    r#"{"isbn":"978-0137081073","qty":7}"#,
                )],
            }),
            Err(LlmError::Unauthorized),
        ])
        .await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({ "session_id": "desk-5", "message": "restock clean coder by 7" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let stock: i64 =
            sqlx::query_scalar("SELECT stock FROM books WHERE isbn = '978-0137081073'")
                .fetch_one(&pool)
                .await
                .expect("stock");
        assert_eq!(stock, 10);

        let audit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tool_calls WHERE session_id = 'desk-5'")
            .fetch_one(&pool)
            .await
            .expect("audit");
        assert_eq!(audit, 1);

        let history = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/desk-5/messages")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let history: SessionHistoryResponse = read_json(history).await;
        let roles: Vec<&str> = history.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user"]);
        assert_eq!(history.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn long_sessions_send_only_the_last_ten_messages() {
        let (app, pool, llm) = app(vec![Ok(Completion::Answer("Noted.".into()))]).await;

        let store = LibraryStore::new(pool.clone());
        let id = SessionId("desk-long".to_string());
        store.sessions().ensure(&id).await.expect("create");
        for index in 0..12 {
            let role = if index % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            store
                .sessions()
                .append_message(&id, role, &format!("message {index}"))
                .await
                .expect("append");
        }

        let response = app
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({ "session_id": "desk-long", "message": "latest question" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let transcript = llm.seen.lock().expect("seen").first().cloned().expect("one call");
        assert_eq!(transcript.len(), 12, "system prompt, ten prior messages, current message");
        let contents: Vec<&str> =
            transcript.iter().filter_map(|message| message.content.as_deref()).collect();
        assert_eq!(contents[0], "system");
        assert_eq!(contents[1], "message 2");
        assert_eq!(contents[10], "message 11");
        assert_eq!(contents[11], "latest question");
    }

    #[tokio::test]
    async fn second_turn_sends_previous_messages_as_history() {
        let (app, _pool, llm) = app(vec![
            Ok(Completion::Answer("Hello!".into())),
            Ok(Completion::Answer("Still here.".into())),
        ])
        .await;

        for text in ["hi", "are you there?"] {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/api/chat",
                    serde_json::json!({ "session_id": "desk-2", "message": text }),
                ))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let seen = llm.seen.lock().expect("seen").clone();
        let second = &seen[1];
        let contents: Vec<&str> =
            second.iter().filter_map(|message| message.content.as_deref()).collect();
        assert_eq!(contents, vec!["system", "hi", "Hello!", "are you there?"]);
    }

    #[tokio::test]
    async fn blank_message_is_bad_request() {
        let (app, _pool, _llm) = app(Vec::new()).await;

        let response = app
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({ "session_id": "desk-3", "message": "   " }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ChatResponse = read_json(response).await;
        assert!(!body.success);
    }

    #[tokio::test]
    async fn malformed_chat_body_gets_a_json_failure() {
        let (app, _pool, llm) = app(Vec::new()).await;

        let garbled = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from("{\"session_id\": \"desk-9\", \"message\": "))
            .expect("request");
        let response = app.clone().oneshot(garbled).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ChatResponse = read_json(response).await;
        assert!(!body.success);
        assert!(body.message.starts_with("An error occurred:"));
        assert!(body.error.as_deref().unwrap_or_default().starts_with("invalid chat request"));

        let missing_message = app
            .oneshot(post_json("/api/chat", serde_json::json!({ "session_id": "desk-9" })))
            .await
            .expect("response");
        assert_eq!(missing_message.status(), StatusCode::BAD_REQUEST);
        let body: ChatResponse = read_json(missing_message).await;
        assert_eq!(body.session_id, "desk-9");
        assert!(!body.success);

        assert!(llm.seen.lock().expect("seen").is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let (app, _pool, _llm) = app(vec![Err(LlmError::Unauthorized)]).await;

        let response = app
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({ "session_id": "desk-4", "message": "hello" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: ChatResponse = read_json(response).await;
        assert!(!body.success);
        assert!(body.message.starts_with("An error occurred:"));
        assert!(body.error.is_some());
    }

    #[tokio::test]
    async fn new_session_generates_or_reuses_ids() {
        let (app, _pool, _llm) = app(Vec::new()).await;

        let generated = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sessions/new")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(generated.status(), StatusCode::OK);
        let generated: SessionResponse = read_json(generated).await;
        assert_eq!(generated.id.len(), 36);

        let reused = app
            .clone()
            .oneshot(post_json("/api/sessions/new", serde_json::json!({ "session_id": generated.id })))
            .await
            .expect("response");
        let reused: SessionResponse = read_json(reused).await;
        assert_eq!(reused, generated);
    }

    #[tokio::test]
    async fn unknown_session_history_is_not_found() {
        let (app, _pool, _llm) = app(Vec::new()).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/missing/messages")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn descriptor_lists_endpoints() {
        let (app, _pool, _llm) = app(Vec::new()).await;

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["endpoints"]["chat"], "POST /api/chat");
    }
}
