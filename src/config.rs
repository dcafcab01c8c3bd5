// ⚙️ Store configuration
//
// Three environments, each with its own database location:
// - Development: local file next to the working directory
// - Testing: in-memory database (fresh per session)
// - Production: file path, normally overridden through VINTAGE_DATABASE

use crate::error::{Result, SeriesError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable selecting the environment
pub const ENV_VAR: &str = "VINTAGE_ENV";

/// Environment variable overriding the database location
pub const DATABASE_VAR: &str = "VINTAGE_DATABASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Production => "production",
        }
    }

    /// Parse an environment name; unknown names are a configuration error
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "" | "default" | "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(SeriesError::Config(format!("unknown environment '{other}'"))),
        }
    }

    /// Read the environment from VINTAGE_ENV (development when unset)
    pub fn from_env() -> Result<Self> {
        match env::var(ENV_VAR) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Environment::Development),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatabaseLocation {
    InMemory,
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database: DatabaseLocation,

    /// Journal mode for file databases (in-memory databases ignore it)
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,

    /// How long a blocked writer waits before SQLITE_BUSY surfaces
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        StoreConfig {
            database: DatabaseLocation::InMemory,
            journal_mode: default_journal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database: DatabaseLocation::File { path: path.into() },
            ..Self::in_memory()
        }
    }

    /// Defaults for an environment
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::file("vintage_series_dev.db"),
            Environment::Testing => Self::in_memory(),
            Environment::Production => Self::file("vintage_series.db"),
        }
    }

    /// Environment defaults with the VINTAGE_DATABASE override applied
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_env()?;
        let mut config = Self::for_environment(environment);

        if let Ok(location) = env::var(DATABASE_VAR) {
            config.database = parse_location(&location);
        }

        log::debug!(
            "store config for {}: {:?}",
            environment.as_str(),
            config.database
        );
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SeriesError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SeriesError::Config(e.to_string()))
    }

    pub fn is_in_memory(&self) -> bool {
        self.database == DatabaseLocation::InMemory
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

fn parse_location(location: &str) -> DatabaseLocation {
    match location.trim() {
        "" | ":memory:" => DatabaseLocation::InMemory,
        path => DatabaseLocation::File {
            path: PathBuf::from(path),
        },
    }
}
