//! Process configuration read from the environment (and `.env`).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::db::DriverOptions;
use crate::schema::DEFAULT_SCHEMA_TTL;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Credentials used when a record has no encrypted DSN.
#[derive(Clone)]
pub struct LegacyCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LegacyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for LegacyCredentials {
    fn default() -> Self {
        Self {
            username: "postgres".to_string(),
            password: "postgres".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub encryption_key: String,
    pub legacy_credentials: LegacyCredentials,
    pub connections_file: PathBuf,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout: Duration,
    pub pool_idle_timeout: Duration,
    /// How often idle pools are looked for.
    pub pool_reap_interval: Duration,
    pub query_timeout: Duration,
    pub schema_ttl: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("encryption_key", &crate::vault::mask_secret(&self.encryption_key, 2))
            .field("legacy_credentials", &self.legacy_credentials)
            .field("connections_file", &self.connections_file)
            .field("pool_max_connections", &self.pool_max_connections)
            .field("pool_acquire_timeout", &self.pool_acquire_timeout)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("pool_reap_interval", &self.pool_reap_interval)
            .field("query_timeout", &self.query_timeout)
            .field("schema_ttl", &self.schema_ttl)
            .finish()
    }
}

impl Config {
    /// Defaults for everything except the key.
    pub fn new(encryption_key: impl Into<String>) -> Self {
        Self {
            encryption_key: encryption_key.into(),
            legacy_credentials: LegacyCredentials::default(),
            connections_file: PathBuf::from("connections.json"),
            pool_max_connections: 5,
            pool_acquire_timeout: Duration::from_secs(3),
            pool_idle_timeout: Duration::from_secs(300),
            pool_reap_interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            schema_ttl: DEFAULT_SCHEMA_TTL,
        }
    }

    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = lookup("AES_ENCRYPTION_KEY")
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("AES_ENCRYPTION_KEY"))?;
        if key.len() < 16 {
            tracing::warn!(
                "AES_ENCRYPTION_KEY is shorter than 16 characters; use a strong 32-byte secret"
            );
        }

        let mut config = Config::new(key);

        if let Some(username) = lookup("DB_USERNAME") {
            config.legacy_credentials.username = username;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            config.legacy_credentials.password = password;
        }
        if let Some(path) = lookup("SQLGATE_CONNECTIONS_FILE") {
            config.connections_file = PathBuf::from(path);
        }

        if let Some(n) = parse(&lookup, "SQLGATE_POOL_MAX_CONNECTIONS")? {
            config.pool_max_connections =
                u32::try_from(n).map_err(|_| ConfigError::Invalid {
                    key: "SQLGATE_POOL_MAX_CONNECTIONS",
                    value: n.to_string(),
                })?;
        }
        if let Some(secs) = parse(&lookup, "SQLGATE_POOL_ACQUIRE_TIMEOUT_SECS")? {
            config.pool_acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "SQLGATE_POOL_IDLE_SECS")? {
            config.pool_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "SQLGATE_POOL_REAP_SECS")? {
            config.pool_reap_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "SQLGATE_QUERY_TIMEOUT_SECS")? {
            config.query_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "SQLGATE_SCHEMA_TTL_SECS")? {
            config.schema_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            max_connections: self.pool_max_connections,
            acquire_timeout: self.pool_acquire_timeout,
            statement_timeout: Some(self.query_timeout),
        }
    }
}

fn parse<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_requires_key() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AES_ENCRYPTION_KEY")));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("AES_ENCRYPTION_KEY", "k")])).unwrap();
        assert_eq!(config.pool_max_connections, 5);
        assert_eq!(config.pool_acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.schema_ttl, Duration::from_secs(3600));
        assert_eq!(config.legacy_credentials.username, "postgres");
        assert_eq!(config.connections_file, PathBuf::from("connections.json"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("AES_ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef"),
            ("DB_USERNAME", "reader"),
            ("SQLGATE_QUERY_TIMEOUT_SECS", "5"),
            ("SQLGATE_POOL_MAX_CONNECTIONS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.legacy_credentials.username, "reader");
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.driver_options().max_connections, 2);
        assert_eq!(config.driver_options().statement_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_bad_numbers() {
        let err = Config::from_lookup(lookup(&[
            ("AES_ENCRYPTION_KEY", "k"),
            ("SQLGATE_POOL_IDLE_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SQLGATE_POOL_IDLE_SECS", .. }));
    }

    #[test]
    fn test_pool_size_must_fit_u32() {
        let err = Config::from_lookup(lookup(&[
            ("AES_ENCRYPTION_KEY", "k"),
            ("SQLGATE_POOL_MAX_CONNECTIONS", "4294967296"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "SQLGATE_POOL_MAX_CONNECTIONS", ref value } if value == "4294967296"
        ));

        let config = Config::from_lookup(lookup(&[
            ("AES_ENCRYPTION_KEY", "k"),
            ("SQLGATE_POOL_MAX_CONNECTIONS", "4294967295"),
            ("SQLGATE_POOL_REAP_SECS", "15"),
        ]))
        .unwrap();
        assert_eq!(config.pool_max_connections, u32::MAX);
        assert_eq!(config.pool_reap_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_debug_masks_secrets() {
        let mut config = Config::new("a-very-secret-key");
        config.legacy_credentials.password = "hunter2".into();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("a-very-secret-key"));
        assert!(!rendered.contains("hunter2"));
    }
}
