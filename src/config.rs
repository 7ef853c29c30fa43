use std::path::PathBuf;
use std::time::Duration;

use crate::llm::ProviderKind;
use crate::store::connections::{ConnectionMode, PoolPolicy};
use crate::vault::crypto::PLACEHOLDER_KEY;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Server default database, used in global mode and as the per-token fallback.
    pub database_url: String,
    pub auth_mode: ConnectionMode,
    pub token_file: PathBuf,
    pub secret_key: String,
    pub session_ttl: Duration,
    pub pool: PoolPolicy,
    pub statement_timeout_ms: u64,
    pub sweep_interval: Duration,
    pub llm: LlmConfig,
    pub max_tool_turns: usize,
    pub tool_timeout: Duration,
    pub kb_url: Option<String>,
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Explicit default; otherwise the first configured of anthropic, openai, ollama.
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".into(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".into(),
            ollama_url: None,
            max_tokens: 4096,
            temperature: 0.7,
            max_retries: 3,
            timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// True when the secret key is still the shipped placeholder.
    pub fn has_placeholder_key(&self) -> bool {
        self.secret_key == PLACEHOLDER_KEY
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let secret_key = std::env::var("PGMCP_SECRET_KEY").unwrap_or_else(|_| PLACEHOLDER_KEY.into());

    if secret_key == PLACEHOLDER_KEY {
        let env_mode = std::env::var("PGMCP_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "PGMCP_SECRET_KEY is still the insecure placeholder. \
                 Set a proper 64-char hex key before running in production."
            );
        }
        eprintln!("warning: PGMCP_SECRET_KEY is not set, saved connection passwords use an insecure placeholder key");
    }

    let auth_mode = match env_opt("PGMCP_AUTH_MODE") {
        Some(raw) => raw.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        None => ConnectionMode::Global,
    };

    let provider = match env_opt("PGMCP_LLM_PROVIDER") {
        Some(raw) => Some(raw.parse().map_err(|e: String| anyhow::anyhow!(e))?),
        None => None,
    };

    let pool = PoolPolicy {
        max_open: env_parse("PGMCP_POOL_MAX_OPEN", 10),
        max_idle: env_parse("PGMCP_POOL_MAX_IDLE", 4),
        max_lifetime: Duration::from_secs(env_parse("PGMCP_POOL_MAX_LIFETIME_SECS", 1800)),
        idle_timeout: Duration::from_secs(env_parse("PGMCP_POOL_IDLE_TIMEOUT_SECS", 600)),
    };
    pool.validate().map_err(|e| anyhow::anyhow!(e))?;

    let defaults = LlmConfig::default();
    let llm = LlmConfig {
        provider,
        model: env_opt("PGMCP_LLM_MODEL"),
        anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
        anthropic_base_url: env_opt("ANTHROPIC_BASE_URL").unwrap_or(defaults.anthropic_base_url),
        openai_api_key: env_opt("OPENAI_API_KEY"),
        openai_base_url: env_opt("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
        ollama_url: env_opt("OLLAMA_URL"),
        max_tokens: env_parse("PGMCP_LLM_MAX_TOKENS", defaults.max_tokens),
        temperature: env_parse("PGMCP_LLM_TEMPERATURE", defaults.temperature),
        max_retries: env_parse("PGMCP_LLM_MAX_RETRIES", defaults.max_retries),
        timeout: Duration::from_secs(env_parse("PGMCP_LLM_TIMEOUT_SECS", 120)),
    };

    Ok(Config {
        port: env_parse("PGMCP_PORT", 8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/postgres".into()),
        auth_mode,
        token_file: env_opt("PGMCP_TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pgmcp-tokens.yaml")),
        secret_key,
        session_ttl: Duration::from_secs(env_parse("PGMCP_SESSION_TTL_SECS", 24 * 60 * 60)),
        pool,
        statement_timeout_ms: env_parse("PGMCP_STATEMENT_TIMEOUT_MS", 30_000),
        sweep_interval: Duration::from_secs(env_parse("PGMCP_SWEEP_INTERVAL_SECS", 60).max(1)),
        llm,
        max_tool_turns: env_parse("PGMCP_MAX_TOOL_TURNS", 10).max(1),
        tool_timeout: Duration::from_secs(env_parse("PGMCP_TOOL_TIMEOUT_SECS", 60)),
        kb_url: env_opt("PGMCP_KB_URL"),
        log_json: env_opt("PGMCP_LOG_FORMAT").as_deref() == Some("json"),
    })
}
