//! Core configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides except
//! `TANGRAM_LOG_LEVEL`, which takes precedence over `core.log_level` so an
//! operator can bump verbosity without editing the file.
//!
//! # Required fields
//! - `core.redis_url`
//! - `channel.jwt_secret`
//!
//! Everything else has a default matching the upstream Python config
//! dataclasses this was ported from.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (the validated, defaulted shape the rest of the crate uses)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,
    pub server: ServerConfig,
    pub channel: ChannelConfig,
    pub map: MapConfig,
    pub cache: CacheConfig,
    /// Sub-documents keyed by plugin name, e.g. `plugins.tangram_history`.
    /// Parsed on demand via [`Config::history_config`].
    pub plugins: toml::Table,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub redis_url: String,
    pub plugins: Vec<String>,
    pub log_level: String,
}

/// Parsed and carried through untouched; the HTTP/static layer this
/// configures is not part of the core and is out of scope here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub id_length: usize,
}

/// Frontend map styling; parsed because the config file carries it, not
/// because anything in this crate renders it.
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub raw: toml::Table,
}

/// Tile/font proxy cache entries; parsed and otherwise unused here.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub raw: toml::Table,
}

/// The `plugins.tangram_history` (or equivalent) sub-document.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub base_path: String,
    pub redis_read_count: u32,
    pub redis_read_block_ms: u64,
    pub history_buffer_size: usize,
    pub history_flush_interval_secs: u64,
    pub history_optimize_interval_secs: u64,
    pub history_optimize_target_file_size: u64,
    pub history_vacuum_interval_secs: u64,
    pub history_vacuum_retention_period_secs: u64,
    pub state_vector_expire: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (all-Option)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    core: Option<RawCoreConfig>,
    server: Option<RawServerConfig>,
    channel: Option<RawChannelConfig>,
    #[serde(default)]
    map: toml::Table,
    #[serde(default)]
    cache: toml::Table,
    #[serde(default)]
    plugins: toml::Table,
}

#[derive(Debug, Deserialize, Default)]
struct RawCoreConfig {
    redis_url: Option<String>,
    plugins: Option<Vec<String>>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct RawChannelConfig {
    host: Option<String>,
    port: Option<u16>,
    public_url: Option<String>,
    jwt_secret: Option<String>,
    jwt_expiration_secs: Option<u64>,
    id_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RawHistoryConfig {
    base_path: Option<String>,
    redis_read_count: Option<u32>,
    redis_read_block_ms: Option<u64>,
    history_buffer_size: Option<usize>,
    history_flush_interval_secs: Option<u64>,
    history_optimize_interval_secs: Option<u64>,
    history_optimize_target_file_size: Option<u64>,
    history_vacuum_interval_secs: Option<u64>,
    history_vacuum_retention_period_secs: Option<u64>,
    state_vector_expire: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/tangram/tangram.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/tangram/tangram.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_core = raw.core.unwrap_or_default();
    let redis_url = raw_core
        .redis_url
        .ok_or_else(|| ConfigError::MissingField("core.redis_url".to_owned()))?;
    let core = CoreConfig {
        redis_url,
        plugins: raw_core.plugins.unwrap_or_default(),
        log_level: raw_core.log_level.unwrap_or_else(|| "INFO".to_owned()),
    };

    let raw_server = raw.server.unwrap_or_default();
    let server = ServerConfig {
        host: raw_server.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
        port: raw_server.port.unwrap_or(2346),
    };

    let raw_channel = raw
        .channel
        .ok_or_else(|| ConfigError::MissingField("channel".to_owned()))?;
    let jwt_secret = raw_channel
        .jwt_secret
        .ok_or_else(|| ConfigError::MissingField("channel.jwt_secret".to_owned()))?;
    let channel = ChannelConfig {
        host: raw_channel.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
        port: raw_channel.port.unwrap_or(2347),
        public_url: raw_channel.public_url,
        jwt_secret,
        // 10 years, matching the upstream default — this is a long-lived
        // internal service token, not an end-user session.
        jwt_expiration_secs: raw_channel.jwt_expiration_secs.unwrap_or(315_360_000),
        id_length: raw_channel.id_length.unwrap_or(8),
    };

    if channel.id_length == 0 {
        return Err(ConfigError::InvalidValue(
            "channel.id_length must be at least 1".to_owned(),
        ));
    }

    Ok(Config {
        core,
        server,
        channel,
        map: MapConfig { raw: raw.map },
        cache: CacheConfig { raw: raw.cache },
        plugins: raw.plugins,
    })
}

impl Config {
    /// Parse the `plugins.<name>` sub-document as a [`HistoryConfig`].
    pub fn history_config(&self, plugin_name: &str) -> Result<HistoryConfig, ConfigError> {
        let raw_value = self
            .plugins
            .get(plugin_name)
            .ok_or_else(|| ConfigError::MissingField(format!("plugins.{plugin_name}")))?;
        let raw: RawHistoryConfig = raw_value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        let base_path = raw
            .base_path
            .ok_or_else(|| ConfigError::MissingField(format!("plugins.{plugin_name}.base_path")))?;
        Ok(HistoryConfig {
            base_path,
            redis_read_count: raw.redis_read_count.unwrap_or(100),
            redis_read_block_ms: raw.redis_read_block_ms.unwrap_or(1000),
            history_buffer_size: raw.history_buffer_size.unwrap_or(100_000),
            history_flush_interval_secs: raw.history_flush_interval_secs.unwrap_or(5),
            history_optimize_interval_secs: raw.history_optimize_interval_secs.unwrap_or(120),
            history_optimize_target_file_size: raw
                .history_optimize_target_file_size
                .unwrap_or(128 * 1024 * 1024),
            history_vacuum_interval_secs: raw.history_vacuum_interval_secs.unwrap_or(120),
            history_vacuum_retention_period_secs: raw
                .history_vacuum_retention_period_secs
                .unwrap_or(7 * 24 * 3600),
            state_vector_expire: raw.state_vector_expire.unwrap_or(600),
        })
    }

    /// Effective log level: `TANGRAM_LOG_LEVEL` env var, else `core.log_level`.
    pub fn effective_log_level(&self) -> String {
        std::env::var("TANGRAM_LOG_LEVEL").unwrap_or_else(|_| self.core.log_level.clone())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
