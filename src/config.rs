//! Environment-driven configuration for Docs MCP.
//!
//! This module loads and validates settings once at startup (via `init_config`) and exposes
//! a global, read-only view through `get_config`. The configuration powers the transport,
//! the retrieval pipeline, and the identity/rate-limit plumbing and includes:
//!
//! - Postgres connectivity (`DATABASE_URL`, `DATABASE_MAX_CONNECTIONS?`,
//!   `DATABASE_CONNECT_TIMEOUT_SECS?`, `DATABASE_IDLE_TIMEOUT_SECS?`).
//! - Embedding provider (`EMBEDDING_API_URL`, `EMBEDDING_API_KEYS`, `EMBEDDING_MODEL`,
//!   `EMBEDDING_DIMENSION?`, `EMBEDDING_TIMEOUT_SECS?`).
//! - Reranker provider (`RERANK_API_URL`, `RERANK_API_KEYS`, `RERANK_MODEL`,
//!   `RERANK_INSTRUCTION?`).
//! - Retrieval tuning (`SMALL_DOCUMENT_THRESHOLD?`, `SEARCH_MAX_RESULTS?`,
//!   `SEARCH_DEFAULT_RESULTS?`).
//! - Session behavior (`SESSIONS_ENABLED?`) and the HTTP port (`SERVER_PORT?`).
//! - Per-plan rate limits (`RATE_LIMIT_FREE_SHORT?`, `RATE_LIMIT_FREE_LONG?`,
//!   `RATE_LIMIT_PRO_SHORT?`, `RATE_LIMIT_PRO_LONG?`).
//! - JSON file logging (`DOCS_MCP_LOG_FILE?`; stdout only when unset).
//!
//! Most fields are optional with sensible defaults; invalid combinations are flagged early
//! with descriptive errors so misconfiguration is easy to diagnose.
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Docs MCP server.
#[derive(Debug)]
pub struct Config {
    /// Postgres DSN holding the corpus and identity tables.
    pub database_url: String,
    /// Upper bound on pooled Postgres connections.
    pub database_max_connections: u32,
    /// Seconds to wait when acquiring a pooled connection.
    pub database_connect_timeout_secs: u64,
    /// Seconds an idle pooled connection may linger before being closed.
    pub database_idle_timeout_secs: u64,
    /// Base URL of the embedding API.
    pub embedding_api_url: String,
    /// Credentials for the embedding API, in failover order.
    pub embedding_api_keys: Vec<String>,
    /// Model identifier passed to the embedding API.
    pub embedding_model: String,
    /// Dimensionality of the corpus embedding vectors.
    pub embedding_dimension: usize,
    /// Per-request deadline for embedding calls, in seconds.
    pub embedding_timeout_secs: u64,
    /// Base URL of the rerank API.
    pub rerank_api_url: String,
    /// Credentials for the rerank API, in failover order.
    pub rerank_api_keys: Vec<String>,
    /// Model identifier passed to the rerank API.
    pub rerank_model: String,
    /// Instruction sentence sent with every rerank request.
    pub rerank_instruction: String,
    /// Content length below which results are packed together before reranking.
    pub small_document_threshold: usize,
    /// Maximum `result_count` accepted from clients.
    pub search_max_results: usize,
    /// Result count used when clients omit `result_count`.
    pub search_default_results: usize,
    /// Whether the transport issues and validates `Mcp-Session-Id` values.
    pub sessions_enabled: bool,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Short-window request limit for the free tier (per minute).
    pub rate_limit_free_short: u32,
    /// Long-window request limit for the free tier (per week).
    pub rate_limit_free_long: u32,
    /// Short-window request limit for the pro tier (per minute).
    pub rate_limit_pro_short: u32,
    /// Long-window request limit for the pro tier (per week).
    pub rate_limit_pro_long: u32,
    /// Optional path receiving newline-delimited JSON log records.
    pub log_file: Option<String>,
}

/// Default instruction sentence forwarded to the reranker.
pub const DEFAULT_RERANK_INSTRUCTION: &str =
    "Given a technical documentation search query, rank the documents by how well they answer the query.";

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let small_document_threshold = load_usize_with_default("SMALL_DOCUMENT_THRESHOLD", 1500)?;
        let search_max_results = load_usize_with_default("SEARCH_MAX_RESULTS", 10)?;
        let search_default_results = load_usize_with_default("SEARCH_DEFAULT_RESULTS", 5)?;

        if search_max_results == 0 || search_max_results > 50 {
            return Err(ConfigError::InvalidValue(
                "SEARCH_MAX_RESULTS must be between 1 and 50".into(),
            ));
        }
        if search_default_results == 0 || search_default_results > search_max_results {
            return Err(ConfigError::InvalidValue(
                "SEARCH_DEFAULT_RESULTS must be between 1 and SEARCH_MAX_RESULTS".into(),
            ));
        }

        let embedding_dimension = load_usize_with_default("EMBEDDING_DIMENSION", 2560)?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue(
                "EMBEDDING_DIMENSION must be greater than zero".into(),
            ));
        }

        Ok(Self {
            database_url: load_env("DATABASE_URL")?,
            database_max_connections: load_u32_with_default("DATABASE_MAX_CONNECTIONS", 20)?,
            database_connect_timeout_secs: load_u64_with_default(
                "DATABASE_CONNECT_TIMEOUT_SECS",
                5,
            )?,
            database_idle_timeout_secs: load_u64_with_default("DATABASE_IDLE_TIMEOUT_SECS", 300)?,
            embedding_api_url: load_env("EMBEDDING_API_URL")?,
            embedding_api_keys: load_key_list("EMBEDDING_API_KEYS")?,
            embedding_model: load_env("EMBEDDING_MODEL")?,
            embedding_dimension,
            embedding_timeout_secs: load_u64_with_default("EMBEDDING_TIMEOUT_SECS", 30)?,
            rerank_api_url: load_env("RERANK_API_URL")?,
            rerank_api_keys: load_key_list("RERANK_API_KEYS")?,
            rerank_model: load_env("RERANK_MODEL")?,
            rerank_instruction: load_env_optional("RERANK_INSTRUCTION")
                .unwrap_or_else(|| DEFAULT_RERANK_INSTRUCTION.to_string()),
            small_document_threshold,
            search_max_results,
            search_default_results,
            sessions_enabled: load_bool_with_default("SESSIONS_ENABLED", true)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
            rate_limit_free_short: load_u32_with_default("RATE_LIMIT_FREE_SHORT", 60)?,
            rate_limit_free_long: load_u32_with_default("RATE_LIMIT_FREE_LONG", 1000)?,
            rate_limit_pro_short: load_u32_with_default("RATE_LIMIT_PRO_SHORT", 300)?,
            rate_limit_pro_long: load_u32_with_default("RATE_LIMIT_PRO_LONG", 20000)?,
            log_file: load_env_optional("DOCS_MCP_LOG_FILE"),
        })
    }
}

fn load_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        None => Ok(default),
    }
}

fn load_key_list(key: &str) -> Result<Vec<String>, ConfigError> {
    let raw = load_env(key)?;
    let keys: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Err(ConfigError::InvalidValue(key.to_string()));
    }
    Ok(keys)
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        database_max_connections = config.database_max_connections,
        embedding_model = %config.embedding_model,
        embedding_dimension = config.embedding_dimension,
        rerank_model = %config.rerank_model,
        small_document_threshold = config.small_document_threshold,
        search_max_results = config.search_max_results,
        sessions_enabled = config.sessions_enabled,
        server_port = ?config.server_port,
        log_file = ?config.log_file,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
