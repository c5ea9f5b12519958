use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use bookdesk_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_secret(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let prompt_path = config
        .agent
        .system_prompt_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<built-in>".to_string());

    let fields = vec![
        field("database.url", &["BOOKDESK_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["BOOKDESK_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["BOOKDESK_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field("llm.provider", &["BOOKDESK_LLM_PROVIDER"], config.llm.provider.as_str().to_string()),
        field("llm.api_key", &["BOOKDESK_LLM_API_KEY"], api_key),
        field("llm.base_url", &["BOOKDESK_LLM_BASE_URL"], config.llm.effective_base_url()),
        field("llm.model", &["BOOKDESK_LLM_MODEL"], config.llm.model.clone()),
        field("llm.temperature", &["BOOKDESK_LLM_TEMPERATURE"], config.llm.temperature.to_string()),
        field(
            "llm.timeout_secs",
            &["BOOKDESK_LLM_TIMEOUT_SECS"],
            config.llm.timeout_secs.to_string(),
        ),
        field(
            "agent.max_iterations",
            &["BOOKDESK_AGENT_MAX_ITERATIONS"],
            config.agent.max_iterations.to_string(),
        ),
        field(
            "agent.history_limit",
            &["BOOKDESK_AGENT_HISTORY_LIMIT"],
            config.agent.history_limit.to_string(),
        ),
        field("agent.system_prompt_path", &["BOOKDESK_AGENT_SYSTEM_PROMPT_PATH"], prompt_path),
        field(
            "server.bind_address",
            &["BOOKDESK_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        field("server.port", &["BOOKDESK_SERVER_PORT"], config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            &["BOOKDESK_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field(
            "logging.level",
            &["BOOKDESK_LOGGING_LEVEL", "BOOKDESK_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["BOOKDESK_LOGGING_FORMAT", "BOOKDESK_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.into_iter().map(|(key_path, env_keys, value)| {
        let source = field_source(
            key_path,
            env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        render_line(key_path, &value, source)
    }));

    lines.join("\n")
}

type Field = (&'static str, &'static [&'static str], String);

fn field(key_path: &'static str, env_keys: &'static [&'static str], value: String) -> Field {
    (key_path, env_keys, value)
}

fn detect_config_path() -> Option<PathBuf> {
    ["bookdesk.toml", "config/bookdesk.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short key prefix such as `sk-` so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
