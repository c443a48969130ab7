//! Environment-sourced dispatcher settings.
//!
//! All knobs are read once at startup and kept immutable for the process
//! lifetime. Validation failures are fatal — the binary exits 1.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::DispatcherError;

/// Immutable dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Marketplace API origin, e.g. `https://market.example.com`.
    pub api_base: String,
    pub poll_interval: Duration,

    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_cooldown: Duration,

    pub container_memory: String,
    pub container_cpus: String,
    pub container_max_lifetime: Duration,
    pub sandbox_image: String,
    pub sandbox_model: String,

    pub proxy_port: u16,
    pub proxy_rate_limit: u32,
    pub llm_api_base: String,
    pub llm_api_key: String,
    pub embeddings_api_base: String,
    pub embeddings_api_key: String,

    pub max_accepts_per_min: u32,
    pub max_queued_jobs: usize,
    pub ghost_timeout: Duration,

    pub wiki_path: Option<PathBuf>,
    pub jobs_path: PathBuf,
    pub agents_dir: Option<PathBuf>,
    pub keys_file: Option<PathBuf>,
    pub identity_name: Option<String>,
    pub i_address: Option<String>,
    pub privacy_tier: String,
}

impl DispatcherConfig {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, DispatcherError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. `from_env` delegates here;
    /// tests inject maps instead of mutating the process environment.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, DispatcherError> {
        let api_base = var("VAP_API")
            .map(|v| v.trim_end_matches('/').to_string())
            .ok_or_else(|| DispatcherError::Config("VAP_API is required".into()))?;

        let llm_api_key = var("LLM_API_KEY")
            .ok_or_else(|| DispatcherError::Config("LLM_API_KEY is required".into()))?;
        let llm_api_base =
            var("LLM_API_BASE").unwrap_or_else(|| "https://api.openai.com".to_string());
        let embeddings_api_base =
            var("EMBEDDINGS_API_BASE").unwrap_or_else(|| llm_api_base.clone());
        let embeddings_api_key = var("EMBEDDINGS_API_KEY").unwrap_or_else(|| llm_api_key.clone());

        let port_range_start = parse_or(&var, "PORT_RANGE_START", 8100u16)?;
        let port_range_end = parse_or(&var, "PORT_RANGE_END", 8109u16)?;
        if port_range_end < port_range_start {
            return Err(DispatcherError::Config(format!(
                "PORT_RANGE_END ({port_range_end}) must not be below PORT_RANGE_START ({port_range_start})"
            )));
        }

        let agents_dir = var("AGENTS_DIR").map(PathBuf::from);
        let keys_file = var("VAP_KEYS_FILE").map(PathBuf::from);
        if agents_dir.is_none() && keys_file.is_none() {
            return Err(DispatcherError::Config(
                "one of AGENTS_DIR or VAP_KEYS_FILE is required".into(),
            ));
        }

        Ok(Self {
            api_base,
            poll_interval: Duration::from_secs(parse_or(&var, "POLL_INTERVAL", 15u64)?),
            port_range_start,
            port_range_end,
            port_cooldown: Duration::from_millis(parse_or(&var, "PORT_COOLDOWN", 30_000u64)?),
            container_memory: var("CONTAINER_MEMORY").unwrap_or_else(|| "2g".to_string()),
            container_cpus: var("CONTAINER_CPUS").unwrap_or_else(|| "1".to_string()),
            container_max_lifetime: Duration::from_secs(parse_or(
                &var,
                "CONTAINER_MAX_LIFETIME",
                3600u64,
            )?),
            sandbox_image: var("SANDBOX_IMAGE").unwrap_or_else(|| "vap-sandbox:latest".to_string()),
            sandbox_model: var("SANDBOX_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            proxy_port: parse_or(&var, "PROXY_PORT", 9470u16)?,
            proxy_rate_limit: parse_or(&var, "PROXY_RATE_LIMIT", 60u32)?,
            llm_api_base,
            llm_api_key,
            embeddings_api_base,
            embeddings_api_key,
            max_accepts_per_min: parse_or(&var, "MAX_ACCEPTS_PER_MIN", 3u32)?,
            max_queued_jobs: parse_or(&var, "MAX_QUEUED_JOBS", 5usize)?,
            ghost_timeout: Duration::from_secs(parse_or(&var, "GHOST_TIMEOUT", 300u64)?),
            wiki_path: var("WIKI_PATH").map(PathBuf::from),
            jobs_path: var("JOBS_PATH").map(PathBuf::from).unwrap_or_else(|| "jobs".into()),
            agents_dir,
            keys_file,
            identity_name: var("VAP_IDENTITY"),
            i_address: var("VAP_I_ADDRESS"),
            privacy_tier: var("PRIVACY_TIER").unwrap_or_else(|| "standard".to_string()),
        })
    }

    /// Number of ports in the configured range — the hard cap on parallel
    /// containers.
    pub fn port_pool_size(&self) -> usize {
        usize::from(self.port_range_end - self.port_range_start) + 1
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, DispatcherError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| DispatcherError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}
