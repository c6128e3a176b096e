// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Where engine session outputs are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStorage {
    /// Inline in the `flow_sessions.output` column.
    Db,
    /// Uploaded to object storage, with only the URL kept in the row.
    S3,
}

/// Flowroom configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Optional read replica URL, falls back to the primary
    pub readonly_database_url: Option<String>,
    /// Redis connection URL
    pub redis_url: String,
    /// Where session outputs are written
    pub session_storage: SessionStorage,
    /// Bucket for session outputs
    pub sessions_bucket: String,
    /// Bucket for uploaded attachments
    pub attachments_bucket: String,
    /// Domain prefixed to relative attachment paths
    pub attachment_domain: String,
    /// Number of identical messages allowed per contact per 5 minutes
    pub max_repetitions: i64,
    /// How long an org's asset snapshot is reused before reloading
    pub asset_cache_ttl: Duration,
    /// How often the contact fire scheduler polls
    pub fire_poll_interval: Duration,
    /// How often the message retrier polls
    pub retry_poll_interval: Duration,
    /// Contacts per flow start batch
    pub start_batch_size: usize,
    /// How long channel logs are retained
    pub channel_log_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/flowroom".to_string(),
            readonly_database_url: None,
            redis_url: "redis://localhost:6379/15".to_string(),
            session_storage: SessionStorage::Db,
            sessions_bucket: "sessions".to_string(),
            attachments_bucket: "attachments".to_string(),
            attachment_domain: "attachments.example.com".to_string(),
            max_repetitions: 20,
            asset_cache_ttl: Duration::from_secs(5),
            fire_poll_interval: Duration::from_secs(10),
            retry_poll_interval: Duration::from_secs(60),
            start_batch_size: 100,
            channel_log_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLOWROOM_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Everything else falls back to [`Config::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("FLOWROOM_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLOWROOM_DATABASE_URL"))?;

        let readonly_database_url = std::env::var("FLOWROOM_READONLY_DATABASE_URL").ok();

        let redis_url = std::env::var("FLOWROOM_REDIS_URL").unwrap_or(defaults.redis_url);

        let session_storage = match std::env::var("FLOWROOM_SESSION_STORAGE")
            .unwrap_or_else(|_| "db".to_string())
            .as_str()
        {
            "db" => SessionStorage::Db,
            "s3" => SessionStorage::S3,
            _ => {
                return Err(ConfigError::Invalid(
                    "FLOWROOM_SESSION_STORAGE",
                    "must be 'db' or 's3'",
                ));
            }
        };

        let sessions_bucket =
            std::env::var("FLOWROOM_S3_SESSIONS_BUCKET").unwrap_or(defaults.sessions_bucket);
        let attachments_bucket = std::env::var("FLOWROOM_S3_ATTACHMENTS_BUCKET")
            .unwrap_or(defaults.attachments_bucket);
        let attachment_domain =
            std::env::var("FLOWROOM_ATTACHMENT_DOMAIN").unwrap_or(defaults.attachment_domain);

        let max_repetitions = parse_var("FLOWROOM_MAX_REPETITIONS", 20i64)?;
        if max_repetitions < 1 {
            return Err(ConfigError::Invalid(
                "FLOWROOM_MAX_REPETITIONS",
                "must be a positive integer",
            ));
        }

        let asset_cache_ttl = Duration::from_secs(parse_var("FLOWROOM_ASSET_CACHE_TTL_SECS", 5)?);
        let fire_poll_interval =
            Duration::from_secs(parse_var("FLOWROOM_FIRE_POLL_INTERVAL_SECS", 10)?);
        let retry_poll_interval =
            Duration::from_secs(parse_var("FLOWROOM_RETRY_POLL_INTERVAL_SECS", 60)?);
        let start_batch_size: usize = parse_var("FLOWROOM_START_BATCH_SIZE", 100)?;
        if start_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "FLOWROOM_START_BATCH_SIZE",
                "must be a positive integer",
            ));
        }
        let channel_log_ttl =
            Duration::from_secs(parse_var::<u64>("FLOWROOM_CHANNEL_LOG_TTL_DAYS", 7)? * 24 * 3600);

        Ok(Self {
            database_url,
            readonly_database_url,
            redis_url,
            session_storage,
            sessions_bucket,
            attachments_bucket,
            attachment_domain,
            max_repetitions,
            asset_cache_ttl,
            fire_poll_interval,
            retry_poll_interval,
            start_batch_size,
            channel_log_ttl,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "FLOWROOM_READONLY_DATABASE_URL",
        "FLOWROOM_REDIS_URL",
        "FLOWROOM_SESSION_STORAGE",
        "FLOWROOM_S3_SESSIONS_BUCKET",
        "FLOWROOM_S3_ATTACHMENTS_BUCKET",
        "FLOWROOM_ATTACHMENT_DOMAIN",
        "FLOWROOM_MAX_REPETITIONS",
        "FLOWROOM_ASSET_CACHE_TTL_SECS",
        "FLOWROOM_FIRE_POLL_INTERVAL_SECS",
        "FLOWROOM_RETRY_POLL_INTERVAL_SECS",
        "FLOWROOM_START_BATCH_SIZE",
        "FLOWROOM_CHANNEL_LOG_TTL_DAYS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("FLOWROOM_DATABASE_URL", "postgres://localhost/test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.readonly_database_url, None);
        assert_eq!(config.redis_url, "redis://localhost:6379/15");
        assert_eq!(config.session_storage, SessionStorage::Db);
        assert_eq!(config.sessions_bucket, "sessions");
        assert_eq!(config.max_repetitions, 20);
        assert_eq!(config.asset_cache_ttl, Duration::from_secs(5));
        assert_eq!(config.start_batch_size, 100);
        assert_eq!(config.channel_log_ttl, Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("FLOWROOM_DATABASE_URL", "postgres://user:pass@db:5432/prod");
        guard.set("FLOWROOM_READONLY_DATABASE_URL", "postgres://replica/prod");
        guard.set("FLOWROOM_SESSION_STORAGE", "s3");
        guard.set("FLOWROOM_MAX_REPETITIONS", "5");
        guard.set("FLOWROOM_START_BATCH_SIZE", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.readonly_database_url.as_deref(),
            Some("postgres://replica/prod")
        );
        assert_eq!(config.session_storage, SessionStorage::S3);
        assert_eq!(config.max_repetitions, 5);
        assert_eq!(config.start_batch_size, 250);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("FLOWROOM_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FLOWROOM_DATABASE_URL")));
        assert!(err.to_string().contains("FLOWROOM_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("FLOWROOM_DATABASE_URL", "postgres://localhost/test");

        guard.set("FLOWROOM_SESSION_STORAGE", "disk");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("FLOWROOM_SESSION_STORAGE", _))
        ));

        guard.set("FLOWROOM_SESSION_STORAGE", "db");
        guard.set("FLOWROOM_MAX_REPETITIONS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("FLOWROOM_MAX_REPETITIONS", _))
        ));

        guard.set("FLOWROOM_MAX_REPETITIONS", "20");
        guard.set("FLOWROOM_START_BATCH_SIZE", "abc");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("FLOWROOM_START_BATCH_SIZE", _))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
