use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cooldown::CooldownDurations;
use crate::password;
use crate::storage::{self, FileLock, DEFAULT_LOCK_TIMEOUT};

/// Ten years. Cooldowns and session lifetimes are added to timestamps, so they
/// need a bound well inside chrono's range.
const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    pub log_level: Option<String>,
    pub command_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub data_dir: Option<String>,
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_free_cooldown")]
    pub free: u64,
    #[serde(default = "default_premium_cooldown")]
    pub premium: u64,
}

fn default_free_cooldown() -> u64 {
    86_400
}

fn default_premium_cooldown() -> u64 {
    3_600
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            free: default_free_cooldown(),
            premium: default_premium_cooldown(),
        }
    }
}

/// Who counts as admin / premium. Membership comes from outside the bot:
/// explicit user ids, or the admins / members of a Telegram chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolesConfig {
    #[serde(default)]
    pub admin_users: Vec<u64>,
    #[serde(default)]
    pub premium_users: Vec<u64>,
    pub admin_chat_id: Option<i64>,
    pub premium_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub title: Option<String>,
    pub show_service: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_username")]
    pub username: String,
    pub password_hash: Option<String>,
    pub session_ttl_secs: Option<u64>,
}

fn default_web_host() -> String {
    "127.0.0.1".into()
}

fn default_web_port() -> u16 {
    5000
}

fn default_web_username() -> String {
    "admin".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            username: default_web_username(),
            password_hash: None,
            session_ttl_secs: None,
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.runtime.data_dir.as_deref().unwrap_or("./data"))
    }

    pub fn lock_timeout(&self) -> Duration {
        self.runtime
            .lock_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn cooldowns(&self) -> CooldownDurations {
        CooldownDurations::from_secs(self.cooldown.free, self.cooldown.premium)
    }

    pub fn command_prefix(&self) -> &str {
        self.bot.command_prefix.as_deref().unwrap_or("/")
    }

    pub fn title(&self) -> &str {
        self.display.title.as_deref().unwrap_or("Account Generator")
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.web.session_ttl_secs.unwrap_or(12 * 3600) as i64)
    }
}

/// YAML is a superset of JSON, so `config.json` files load here too.
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse config")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.cooldown.free == 0 || cfg.cooldown.premium == 0 {
        return Err(anyhow!(
            "cooldown.free={} cooldown.premium={} must both be > 0",
            cfg.cooldown.free,
            cfg.cooldown.premium
        ));
    }
    if cfg.cooldown.free > MAX_DURATION_SECS || cfg.cooldown.premium > MAX_DURATION_SECS {
        return Err(anyhow!(
            "cooldown.free={} cooldown.premium={} must be at most {} seconds",
            cfg.cooldown.free,
            cfg.cooldown.premium,
            MAX_DURATION_SECS
        ));
    }
    if let Some(ttl) = cfg.web.session_ttl_secs {
        if ttl == 0 || ttl > MAX_DURATION_SECS {
            return Err(anyhow!(
                "web.session_ttl_secs={} must be in 1..={}",
                ttl,
                MAX_DURATION_SECS
            ));
        }
    }
    let prefix = cfg.command_prefix();
    if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
        return Err(anyhow!(
            "bot.command_prefix '{}' must be non-empty without whitespace",
            prefix
        ));
    }
    if cfg.web.username.trim().is_empty() {
        return Err(anyhow!("web.username must not be empty"));
    }
    if let Some(h) = &cfg.web.password_hash {
        password::validate_hash(h).context("web.password_hash")?;
    }
    if cfg.runtime.lock_timeout_ms == Some(0) {
        return Err(anyhow!("runtime.lock_timeout_ms must be > 0"));
    }
    Ok(())
}

/// Rewrites the web login section of the config file, keeping the rest of the
/// file as it is on disk.
pub fn save_web_credentials(
    path: &Path,
    username: &str,
    password_hash: Option<&str>,
    lock_timeout: Duration,
) -> Result<Config> {
    let _lock = FileLock::acquire(path, lock_timeout)?;
    let mut cfg = load_config(path)?;
    cfg.web.username = username.to_string();
    if let Some(h) = password_hash {
        cfg.web.password_hash = Some(h.to_string());
    }
    validate_config(&cfg)?;

    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let bytes = if is_json {
        serde_json::to_vec_pretty(&cfg).context("encode config")?
    } else {
        serde_yaml::to_string(&cfg).context("encode config")?.into_bytes()
    };
    storage::write_atomic(path, &bytes)
        .with_context(|| format!("write config: {}", path.display()))?;
    Ok(cfg)
}
