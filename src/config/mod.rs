use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use rocket::figment::{
    providers::{Format, Toml},
    Figment, Profile,
};
use serde::Deserialize;

use crate::whitelist::Whitelist;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_address")]
    pub address: String,
    /// Allowed remote hosts; empty means every host.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Disk cache directory; the memory store is used when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Disk cache budget in megabytes.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// Origin request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub allow_private_addresses: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_cache_size() -> u64 {
    100
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("imageproxy/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            whitelist: Vec::new(),
            cache_dir: None,
            cache_size: default_cache_size(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            allow_private_addresses: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Disk { path: PathBuf, max_bytes: u64 },
}

impl AppConfig {
    pub fn cache_max_bytes(&self) -> u64 {
        self.cache_size.saturating_mul(MIB)
    }

    pub fn backend(&self) -> CacheBackend {
        match &self.cache_dir {
            Some(path) if !path.as_os_str().is_empty() => CacheBackend::Disk {
                path: path.clone(),
                max_bytes: self.cache_max_bytes(),
            },
            _ => CacheBackend::Memory,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(&self.whitelist).allow_private_addresses(self.allow_private_addresses)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Rocket defaults, then `App.toml` (nested profiles), then environment
/// overrides. The profile comes from `APP_PROFILE`.
pub fn figment() -> Figment {
    let mut figment = Figment::from(rocket::Config::default())
        .merge(Toml::file("App.toml").nested());

    if let Ok(whitelist) = env::var("WHITELIST") {
        figment = figment.merge(("whitelist", split_list(&whitelist)));
    }

    if let Ok(cache_dir) = env::var("CACHE_DIR") {
        if !cache_dir.trim().is_empty() {
            figment = figment.merge(("cache_dir", cache_dir.trim().to_string()));
        }
    }

    for (var, key) in [("CACHE_SIZE", "cache_size"), ("TIMEOUT", "timeout"), ("PORT", "port")] {
        if let Ok(value) = env::var(var) {
            match value.trim().parse::<u64>() {
                Ok(number) => figment = figment.merge((key, number)),
                Err(_) => warn!("Ignoring {}={:?}: not a number", var, value),
            }
        }
    }

    if let Ok(address) = env::var("ADDRESS") {
        figment = figment.merge(("address", address.trim().to_string()));
    }

    if let Ok(allow) = env::var("ALLOW_PRIVATE_ADDRESSES") {
        let allow = matches!(allow.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        figment = figment.merge(("allow_private_addresses", allow));
    }

    figment.select(Profile::from_env_or("APP_PROFILE", "default"))
}
