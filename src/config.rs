use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use log::warn;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_PATH_VAR: &str = "ROOM_HUB_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Capacity of each room's inbound broadcast queue.
    pub room_queue_capacity: usize,
    /// Capacity of each connection's outbound mailbox.
    pub mailbox_capacity: usize,
    pub token_secret: Option<String>,
    /// Lifetime of issued tokens.
    pub token_ttl_secs: u32,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2052,
            room_queue_capacity: 256,
            mailbox_capacity: 64,
            token_secret: None,
            token_ttl_secs: 24 * 60 * 60,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    /// Defaults, then the JSON file named by `ROOM_HUB_CONFIG`, then `ROOM_HUB_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Config::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ROOM_HUB_HOST") {
            self.host = parse_env("ROOM_HUB_HOST", value)?;
        }
        if let Some(value) = lookup("ROOM_HUB_PORT") {
            self.port = parse_env("ROOM_HUB_PORT", value)?;
        }
        if let Some(value) = lookup("ROOM_HUB_ROOM_QUEUE_CAPACITY") {
            self.room_queue_capacity = parse_env("ROOM_HUB_ROOM_QUEUE_CAPACITY", value)?;
        }
        if let Some(value) = lookup("ROOM_HUB_MAILBOX_CAPACITY") {
            self.mailbox_capacity = parse_env("ROOM_HUB_MAILBOX_CAPACITY", value)?;
        }
        if let Some(value) = lookup("ROOM_HUB_TOKEN_SECRET") {
            self.token_secret = Some(value);
        }
        if let Some(value) = lookup("ROOM_HUB_TOKEN_TTL_SECS") {
            self.token_ttl_secs = parse_env("ROOM_HUB_TOKEN_TTL_SECS", value)?;
        }
        if let Some(value) = lookup("ROOM_HUB_TLS_CERT") {
            self.tls_cert_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ROOM_HUB_TLS_KEY") {
            self.tls_key_path = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("room_queue_capacity"));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("mailbox_capacity"));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::ZeroCapacity("token_ttl_secs"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The configured signing secret, or a random one valid for this process only.
    pub fn token_secret(&self) -> String {
        match &self.token_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("No token secret configured, generating an ephemeral one");
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect()
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
