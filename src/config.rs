// src/config.rs
use crate::{PressqError, Result};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde::Deserialize;
use std::time::Duration;

/// Connection settings for the Redis store.
///
/// `url`, when set, wins over the individual fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            connect_timeout_ms: 2500,
        }
    }
}

impl RedisConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Defaults overridden by `PRESSQ_REDIS_URL`, `PRESSQ_REDIS_HOST`,
    /// `PRESSQ_REDIS_PORT`, `PRESSQ_REDIS_PASSWORD` and `PRESSQ_REDIS_DATABASE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("PRESSQ_REDIS_URL").filter(|v| !v.is_empty()) {
            config.url = Some(url);
        }
        if let Some(host) = lookup("PRESSQ_REDIS_HOST").filter(|v| !v.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup("PRESSQ_REDIS_PORT") {
            config.port = port
                .parse()
                .map_err(|_| PressqError::Config(format!("invalid PRESSQ_REDIS_PORT: {port}")))?;
        }
        if let Some(password) = lookup("PRESSQ_REDIS_PASSWORD").filter(|v| !v.is_empty()) {
            config.password = Some(password);
        }
        if let Some(database) = lookup("PRESSQ_REDIS_DATABASE") {
            config.database = database.parse().map_err(|_| {
                PressqError::Config(format!("invalid PRESSQ_REDIS_DATABASE: {database}"))
            })?;
        }

        Ok(config)
    }

    /// Connection target for `redis::Client::open`. The password is passed
    /// as a field, so it may contain any character.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        if let Some(url) = &self.url {
            return url
                .as_str()
                .into_connection_info()
                .map_err(|e| PressqError::Config(format!("invalid Redis URL: {e}")));
        }
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.database,
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
