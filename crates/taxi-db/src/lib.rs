//! Taxi-DB: database bootstrap for the taxi backend.
//!
//! This crate wires SQLite (via rusqlite and r2d2 connection pooling)
//! into three shared handles:
//!
//! - `engine` - the connection target, opened on demand
//! - `session` - the session factory and unit-of-work sessions
//! - `base` - the declarative base that entity schemas register with
//!
//! `bootstrap` bundles them behind [`Database`], and `global` publishes a
//! single bundle per process.
//!
//! # Example
//!
//! ```no_run
//! use taxi_db::Database;
//!
//! let db = Database::bootstrap();
//! let session = db.session();
//! let tables = db.engine().table_names().unwrap();
//! session.close().unwrap();
//! println!("{} tables in {:?}", tables.len(), db.path());
//! ```

pub mod base;
pub mod bootstrap;
pub mod engine;
pub mod global;
pub mod session;

pub use base::{DeclarativeBase, Entity, TableDef};
pub use bootstrap::{Database, DatabaseOptions, DATABASE_FILE};
pub use engine::{Engine, EngineOptions};
pub use session::{Session, SessionFactory, SessionOptions};
