//! Startup wiring: one engine, one session factory, one declarative base.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taxi_core::Result;

use crate::base::DeclarativeBase;
use crate::engine::{Engine, EngineOptions};
use crate::session::{Session, SessionFactory, SessionOptions};

/// Default database file, relative to the working directory.
pub const DATABASE_FILE: &str = "taxi.db";

/// Everything needed to build a [`Database`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Database file. Ignored when `url` is set.
    pub path: PathBuf,
    /// Optional `sqlite://` URL overriding `path`.
    pub url: Option<String>,
    pub engine: EngineOptions,
    pub session: SessionOptions,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DATABASE_FILE),
            url: None,
            engine: EngineOptions::default(),
            session: SessionOptions::default(),
        }
    }
}

/// The shared database handles.
///
/// Build it once at startup and pass it (or clones of its parts) to
/// whatever needs the database. Cloning shares the underlying handles.
#[derive(Debug, Clone)]
pub struct Database {
    engine: Engine,
    sessions: SessionFactory,
    base: DeclarativeBase,
}

impl Database {
    /// Build the handles described by `options`.
    ///
    /// Fails only if `options.url` is malformed. Nothing is read from or
    /// written to disk.
    pub fn open(options: &DatabaseOptions) -> Result<Self> {
        let engine = match options.url.as_deref() {
            Some(url) => Engine::from_url(url, options.engine)?,
            None => Engine::file(&options.path, options.engine),
        };
        Ok(Self::with_engine(engine, options.session))
    }

    /// The fixed default configuration: `taxi.db`, echo off, future on,
    /// autoflush off.
    pub fn bootstrap() -> Self {
        Self::with_engine(
            Engine::file(DATABASE_FILE, EngineOptions::default()),
            SessionOptions::default(),
        )
    }

    pub fn with_engine(engine: Engine, session_options: SessionOptions) -> Self {
        let sessions = SessionFactory::new(engine.clone(), session_options);
        tracing::info!("Database configured for {}", engine.url());
        Self {
            engine,
            sessions,
            base: DeclarativeBase::new(),
        }
    }

    /// The database file, or `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.engine.path()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    pub fn base(&self) -> &DeclarativeBase {
        &self.base
    }

    /// Shorthand for `self.sessions().session()`.
    pub fn session(&self) -> Session {
        self.sessions.session()
    }
}
