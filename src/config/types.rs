use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use taxi_db::{DatabaseOptions, EngineOptions, SessionOptions, DATABASE_FILE};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database file, relative to the working directory unless absolute
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// sqlite:// URL; takes precedence over `path` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Log every executed SQL statement
    #[serde(default)]
    pub echo: bool,

    /// Explicit-commit transactions (default: true)
    #[serde(default = "default_true")]
    pub future: bool,

    /// Flush staged writes before each session query (default: false)
    #[serde(default)]
    pub autoflush: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            url: None,
            echo: false,
            future: true,
            autoflush: false,
        }
    }
}

impl DatabaseConfig {
    /// Options for building the shared database handles.
    pub fn to_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            path: self.path.clone(),
            url: self.url.clone(),
            engine: EngineOptions {
                echo: self.echo,
                future: self.future,
            },
            session: SessionOptions {
                autoflush: self.autoflush,
                future: self.future,
            },
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DATABASE_FILE)
}

fn default_true() -> bool {
    true
}
