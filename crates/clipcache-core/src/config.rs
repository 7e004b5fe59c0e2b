use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "configs/default.toml";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub downloads: DownloadConfig,
    pub locator: LocatorConfig,
    pub nvr: NvrConfig,
    /// Camera id → camera root path on the recorder.
    pub cameras: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8095".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_bytes: u64,
    pub max_entries: usize,
    pub entry_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Headroom kept free on top of an incoming clip, roughly one large clip.
    pub safety_margin_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache/videos"),
            max_bytes: 10 * 1024 * MIB,
            max_entries: 500,
            entry_ttl_secs: 7 * 24 * 3600,
            sweep_interval_secs: 3600,
            safety_margin_bytes: 100 * MIB,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_concurrent: usize,
    /// Deadline for locating a clip and opening the transfer.
    pub safety_timeout_secs: u64,
    /// Longest gap between body chunks before the transfer is abandoned. 0 disables.
    pub idle_timeout_secs: u64,
    pub join_retry_limit: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            safety_timeout_secs: 60,
            idle_timeout_secs: 30,
            join_retry_limit: 3,
        }
    }
}

impl DownloadConfig {
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct LocatorConfig {
    pub match_window_secs: u64,
    pub descriptor_cache_capacity: u64,
    pub descriptor_ttl_secs: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            match_window_secs: 60,
            descriptor_cache_capacity: 1000,
            descriptor_ttl_secs: 3600,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct NvrConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Kept below the recorder's own 60 minute expiry.
    pub session_ttl_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for NvrConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            username: String::new(),
            password: String::new(),
            session_ttl_secs: 50 * 60,
            request_timeout_secs: 20,
        }
    }
}

impl std::fmt::Debug for NvrConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvrConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl NvrConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

static CONFIG_SCHEMA: Lazy<std::result::Result<Validator, String>> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let value = serde_json::to_value(&schema).map_err(|e| e.to_string())?;
    validator_for(&value).map_err(|e| e.to_string())
});

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = CONFIG_SCHEMA
        .as_ref()
        .map_err(|e| anyhow!("config schema unavailable: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    cfg.camera_table()?;
    Ok(cfg)
}

/// Resolve the config file (`CLIPCACHE_CONFIG`, then the default path), load it
/// and apply environment overrides. A missing default file yields defaults.
pub fn load_effective() -> Result<Config> {
    let mut cfg = match std::env::var("CLIPCACHE_CONFIG") {
        Ok(explicit) if !explicit.trim().is_empty() => {
            let path = PathBuf::from(explicit.trim());
            let cfg = load_config(&path)?;
            info!(path = %path.display(), source = "env", "loaded clipcache config");
            cfg
        }
        _ => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.exists() {
                let cfg = load_config(path)?;
                info!(path = %path.display(), source = "search", "loaded clipcache config");
                cfg
            } else {
                warn!(
                    path = %path.display(),
                    "no config file found; using built-in defaults"
                );
                Config::default()
            }
        }
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|s| s.parse::<u64>().ok())
}

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_string("CLIPCACHE_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Some(mb) = env_u64("CLIPCACHE_CACHE_MAX_MB").filter(|v| *v > 0) {
            self.cache.max_bytes = mb.saturating_mul(MIB);
        }
        if let Some(max) = env_u64("CLIPCACHE_MAX_CONC").filter(|v| *v > 0) {
            self.downloads.max_concurrent = max as usize;
        }
        if let Some(bind) = env_string("CLIPCACHE_BIND") {
            self.server.bind = bind;
        }
        if let Some(url) = env_string("CLIPCACHE_NVR_URL") {
            self.nvr.base_url = url;
        }
        if let Some(user) = env_string("CLIPCACHE_NVR_USER") {
            self.nvr.username = user;
        }
        if let Some(password) = env_string("CLIPCACHE_NVR_PASSWORD") {
            self.nvr.password = password;
        }
        if let Some(secs) = env_u64("CLIPCACHE_HTTP_TIMEOUT_SECS").filter(|v| *v > 0) {
            self.nvr.request_timeout_secs = secs;
        }
        self.downloads.max_concurrent = self.downloads.max_concurrent.max(1);
        self.cache.max_entries = self.cache.max_entries.max(1);
    }

    pub fn camera_table(&self) -> Result<HashMap<u32, String>> {
        self.cameras
            .iter()
            .map(|(id, path)| {
                let id = id
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("camera id '{id}' is not numeric"))?;
                let path = path.trim_end_matches('/').to_string();
                if path.is_empty() {
                    return Err(anyhow!("camera {id} has an empty remote path"));
                }
                Ok((id, path))
            })
            .collect()
    }
}
