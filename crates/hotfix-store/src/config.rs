use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;
use crate::session_id::SessionId;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub sessions: Vec<SessionId>,
}

impl Config {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|err| {
            StoreError::Config(format!("failed to read {}: {}", path.display(), err))
        })?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self, StoreError> {
        toml::from_str::<Self>(config_str).map_err(|err| StoreError::Config(err.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    File,
    Redb,
    Sqlite,
}

fn default_operation_timeout() -> u64 {
    5
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Directory for the file backend, database file for redb and SQLite.
    pub path: Option<String>,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64, // in seconds
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    /// The configured path, which every backend but the in-memory one needs.
    pub fn required_path(&self) -> Result<&str, StoreError> {
        self.path.as_deref().ok_or_else(|| {
            StoreError::Config(format!("the {:?} backend requires a path", self.backend))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Backend, Config, StoreConfig};
    use crate::error::StoreError;
    use crate::session_id::SessionId;
    use std::time::Duration;

    #[test]
    fn test_simple_config() {
        let config_contents = r#"
[store]
backend = "sqlite"
path = "./store/messages.db"
operation_timeout = 2

[[sessions]]
begin_string = "FIX.4.4"
sender_comp_id = "send-comp-id"
target_comp_id = "target-comp-id"

[[sessions]]
begin_string = "FIX.4.2"
sender_comp_id = "send-comp-id"
target_comp_id = "target-comp-id"
session_qualifier = "drop-copy"
        "#;

        let config = Config::parse(config_contents).unwrap();
        let expected_store = StoreConfig {
            backend: Backend::Sqlite,
            path: Some("./store/messages.db".to_string()),
            operation_timeout: 2,
        };
        assert_eq!(config.store, expected_store);
        assert_eq!(config.store.operation_timeout(), Duration::from_secs(2));

        assert_eq!(config.sessions.len(), 2);
        assert_eq!(
            config.sessions[0],
            SessionId::new("FIX.4.4", "send-comp-id", "target-comp-id")
        );
        assert_eq!(
            config.sessions[1],
            SessionId::new("FIX.4.2", "send-comp-id", "target-comp-id").with_qualifier("drop-copy")
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("[store]\nbackend = \"in_memory\"\n").unwrap();
        assert_eq!(config.store.backend, Backend::InMemory);
        assert_eq!(config.store.operation_timeout, 5);
        assert!(config.store.path.is_none());
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_empty_qualifier_is_no_qualifier() {
        let config_contents = r#"
[store]
backend = "in_memory"

[[sessions]]
begin_string = "FIX.4.4"
sender_comp_id = "SENDER"
target_comp_id = "TARGET"
session_qualifier = ""
        "#;

        let config = Config::parse(config_contents).unwrap();
        assert_eq!(config.sessions[0].session_qualifier, None);
    }

    #[test]
    fn test_missing_path_is_reported() {
        let config = Config::parse("[store]\nbackend = \"file\"\n").unwrap();
        assert!(matches!(
            config.store.required_path(),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = Config::parse("[store]\nbackend = \"mysql\"\n");
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = Config::load_from_path("/definitely/not/here.toml");
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
