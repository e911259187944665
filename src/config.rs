//! Layered configuration: built-in defaults, overridden by an optional TOML
//! file, overridden by environment variables, overridden by CLI flags.
//! `load_from_file`/`with_overrides` split a single `listen_addr` into a
//! separate `host`/`port` pair plus the accept-loop tuning knobs the TCP
//! server needs.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub replica_set: Option<String>,
    pub log_level: Option<String>,
    pub max_consecutive_accept_failures: u32,
    pub accept_backoff_base_ms: u64,
    pub accept_backoff_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27017,
            database: "test".to_string(),
            replica_set: None,
            log_level: None,
            max_consecutive_accept_failures: 16,
            accept_backoff_base_ms: 10,
            accept_backoff_max_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is `None` or the
    /// file is missing/unreadable, returns defaults. Parse errors surface.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("jongodb.toml");
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| Error::Msg(format!("failed to parse {}: {}", path, e))),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Apply environment-variable overrides (second-highest precedence,
    /// below CLI flags).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("JONGODB_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("JONGODB_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(db) = std::env::var("JONGODB_DATABASE") {
            self.database = db;
        }
        if let Ok(rs) = std::env::var("JONGODB_REPLICA_SET") {
            self.replica_set = Some(rs);
        }
        if let Ok(level) = std::env::var("JONGODB_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        self
    }

    /// Apply CLI-flag overrides (highest precedence).
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        database: Option<String>,
        replica_set: Option<String>,
        log_level: Option<String>,
    ) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(db) = database {
            self.database = db;
        }
        if let Some(rs) = replica_set {
            self.replica_set = Some(rs);
        }
        if let Some(level) = log_level {
            self.log_level = Some(level);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Msg("host cannot be empty".to_string()));
        }
        if self.database.is_empty() || self.database.contains('.') || self.database.contains('$') {
            return Err(Error::Msg(format!(
                "database name '{}' is not a valid database name",
                self.database
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = Config::load_from_file(Some("/nonexistent/path/jongodb.toml")).unwrap();
        assert_eq!(cfg.port, 27017);
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let cfg = Config::default().with_overrides(Some("0.0.0.0".to_string()), Some(0), None, None, None);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.database, "test");
    }

    #[test]
    fn rejects_invalid_database_name() {
        let mut cfg = Config::default();
        cfg.database = "bad.name".to_string();
        assert!(cfg.validate().is_err());
    }
}
