use std::sync::Arc;

use axum::Router;
use bookdesk_agent::conversation::load_system_prompt;
use bookdesk_agent::{
    AgentRuntime, AgentSettings, LlmClient, LlmError, OpenAiCompatibleClient, ToolExecutor,
};
use bookdesk_core::config::AppConfig;
use bookdesk_db::{connect_with_config, migrations, DbPool, LibraryStore};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::chat::{self, ChatService, ChatState};
use crate::health;

pub struct Application {
    pub config: AppConfig,
    pub store: LibraryStore,
    pub agent: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("language model client setup failed: {0}")]
    Llm(#[source] LlmError),
}

impl Application {
    pub fn db_pool(&self) -> &DbPool {
        self.store.pool()
    }

    /// Health and chat routes behind a permissive CORS layer.
    pub fn router(&self) -> Router {
        let service = ChatService::new(
            self.store.clone(),
            self.agent.clone(),
            self.config.agent.history_limit,
        );
        Router::new()
            .merge(health::router(self.db_pool().clone()))
            .merge(chat::router(ChatState::new(service)))
            .layer(CorsLayer::permissive())
    }
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let client = OpenAiCompatibleClient::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    info!(
        event_name = "system.bootstrap.llm_configured",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        model = client.model(),
        endpoint = client.endpoint(),
        "language model client configured"
    );
    bootstrap_with_llm(config, Arc::new(client)).await
}

pub async fn bootstrap_with_llm(
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = LibraryStore::new(db_pool);
    let system_prompt = load_system_prompt(config.agent.system_prompt_path.as_deref());
    let agent = AgentRuntime::new(
        llm,
        ToolExecutor::new(store.clone()),
        system_prompt,
        AgentSettings::from_config(&config.agent, &config.llm),
    );

    Ok(Application { config, store, agent: Arc::new(agent) })
}
