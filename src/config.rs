use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// Layered configuration: compiled-in defaults, overridden by an optional TOML file, overridden
/// by environment variables. Mirrors the `GuildConfigToml`/`toml::from_str` pattern, generalized
/// to a single top-level config rather than a per-guild map.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_dir: PathBuf,
    pub http_addr: String,
    pub reminder_tick: Duration,
    pub imminent_window: Duration,
    pub imminent_cooldown: Duration,
    pub share_token_ttl: Duration,
    /// The path secret the `/webhook/<secret>` route checks against. Defaults to a fixed
    /// development value; real deployments must override it via `$WEBHOOK_SECRET`.
    pub webhook_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_dir: PathBuf::from("./store"),
            http_addr: "0.0.0.0:8080".to_owned(),
            reminder_tick: Duration::from_secs(60),
            imminent_window: Duration::from_secs(2 * 60 * 60),
            imminent_cooldown: Duration::from_secs(30 * 60),
            share_token_ttl: Duration::from_secs(15 * 60),
            webhook_secret: "dev-secret".to_owned(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    store_dir: Option<String>,
    http_addr: Option<String>,
    reminder_tick_secs: Option<u64>,
    imminent_window_secs: Option<u64>,
    imminent_cooldown_secs: Option<u64>,
    share_token_ttl_secs: Option<u64>,
    webhook_secret: Option<String>,
}

impl Config {
    /// Loads defaults, then an optional TOML file (path from `$CONFIG_FILE` or `config.toml` if
    /// that file exists), then environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let config_path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_owned());
        if let Ok(contents) = std::fs::read_to_string(&config_path) {
            let toml: ConfigToml = toml::from_str(&contents)
                .with_context(|| format!("Failed to deserialize config file ({})", config_path))?;
            config.apply_toml(toml);
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_toml(&mut self, toml: ConfigToml) {
        if let Some(dir) = toml.store_dir {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(addr) = toml.http_addr {
            self.http_addr = addr;
        }
        if let Some(secs) = toml.reminder_tick_secs {
            self.reminder_tick = Duration::from_secs(secs);
        }
        if let Some(secs) = toml.imminent_window_secs {
            self.imminent_window = Duration::from_secs(secs);
        }
        if let Some(secs) = toml.imminent_cooldown_secs {
            self.imminent_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = toml.share_token_ttl_secs {
            self.share_token_ttl = Duration::from_secs(secs);
        }
        if let Some(secret) = toml.webhook_secret {
            self.webhook_secret = secret;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Ok(secs) = std::env::var("REMINDER_TICK_SECS") {
            if let Ok(secs) = secs.parse() {
                self.reminder_tick = Duration::from_secs(secs);
            }
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.webhook_secret = secret;
        }
    }
}
