//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use spot_core::{CoreConfig, Platform};

/// Client configuration. File: ~/.config/spotme/config.toml or /etc/spotme/config.toml.
/// Env overrides: SPOTME_ENDPOINT, SPOTME_REQUEST_TIMEOUT_MS, SPOTME_RESERVATION_WINDOW_SECS,
/// SPOTME_REFRESH_INTERVAL_SECS, SPOTME_PLATFORM, SPOTME_NAV_COMMAND.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server WebSocket URL (default ws://127.0.0.1:15024). A bare host:port gets `ws://`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// How long a request waits for its answer (default 10 s).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Soft-reservation window asked from the server (default 10 min).
    #[serde(default = "default_reservation_window_secs")]
    pub reservation_window_secs: u64,
    /// Background RefreshData period; 0 disables the loop (default 30 s).
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Reminder fires this long before the window closes (default 60 s).
    #[serde(default = "default_reminder_lead_secs")]
    pub reminder_lead_secs: u64,
    /// Delay between ReserveSpot retries while a spot is prereserved (default 5 s).
    #[serde(default = "default_prereserve_poll_secs")]
    pub prereserve_poll_secs: u64,
    /// Deep-link flavour for navigation (default web).
    #[serde(default)]
    pub platform: Platform,
    /// Command that opens a deep link, e.g. "xdg-open". `{link}` is substituted,
    /// otherwise the link is appended. Unset: navigation is only logged.
    #[serde(default)]
    pub nav_command: Option<String>,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:15024".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_reservation_window_secs() -> u64 {
    600
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_reminder_lead_secs() -> u64 {
    60
}
fn default_prereserve_poll_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            reservation_window_secs: default_reservation_window_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            reminder_lead_secs: default_reminder_lead_secs(),
            prereserve_poll_secs: default_prereserve_poll_secs(),
            platform: Platform::default(),
            nav_command: None,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            reservation_window: Duration::from_secs(self.reservation_window_secs),
            prereserve_poll: Duration::from_secs(self.prereserve_poll_secs),
            reminder_lead: Duration::from_secs(self.reminder_lead_secs),
            platform: self.platform,
        }
    }

    /// Apply SPOTME_* overrides read through `var`. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("SPOTME_ENDPOINT") {
            if !s.trim().is_empty() {
                self.endpoint = s.trim().to_string();
            }
        }
        override_num(&var, "SPOTME_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_num(&var, "SPOTME_RESERVATION_WINDOW_SECS", &mut self.reservation_window_secs);
        override_num(&var, "SPOTME_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs);
        if let Some(s) = var("SPOTME_PLATFORM") {
            match s.parse::<Platform>() {
                Ok(p) => self.platform = p,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring SPOTME_PLATFORM"),
            }
        }
        if let Some(s) = var("SPOTME_NAV_COMMAND") {
            self.nav_command = (!s.trim().is_empty()).then(|| s.trim().to_string());
        }
    }
}

fn override_num(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut u64) {
    if let Some(s) = var(name) {
        match s.trim().parse::<u64>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var = name, value = %s, "ignoring non-numeric override"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
/// A broken file is reported and skipped rather than fatal.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            tracing::warn!(error = %e, "config file ignored; using defaults");
            Config::default()
        }
    };
    c.apply_env(|name| std::env::var(name).ok());
    c
}

/// Load an explicit file (e.g. `--config`), then env vars.
pub fn load_with(path: &Path) -> Result<Config, ConfigError> {
    let mut c = read(path)?;
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/spotme/config.toml"));
    }
    out.push(PathBuf::from("/etc/spotme/config.toml"));
    out
}

/// First existing path wins; later paths are not consulted even if it fails to parse.
fn load_file() -> Result<Option<Config>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => read(&p).map(Some),
        None => Ok(None),
    }
}

fn read(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
