//! The database engine: a shared, lazily-connecting SQLite target.
//!
//! An [`Engine`] owns an r2d2 pool that starts empty, so constructing one
//! never touches the filesystem. The database file is created or opened
//! the first time a connection is drawn with [`Engine::connect`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use taxi_core::{Error, Result};

/// Type alias for the engine's connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection drawn from an engine. Returned to the pool on drop.
pub type EngineConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Tracing target used for statement echo.
pub const ECHO_TARGET: &str = "taxi_db::echo";

const POOL_SIZE: u32 = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Engine behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Log every executed statement under [`ECHO_TARGET`].
    pub echo: bool,
    /// Opt in to the explicit-commit transaction contract.
    pub future: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            echo: false,
            future: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    File(PathBuf),
    Memory,
}

/// Pool sizing and reaping for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolLimits {
    max_size: u32,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
}

impl PoolLimits {
    fn for_target(target: &Target) -> Self {
        match target {
            Target::File(_) => Self {
                max_size: POOL_SIZE,
                idle_timeout: Some(IDLE_TIMEOUT),
                max_lifetime: Some(MAX_LIFETIME),
            },
            // The database lives inside its only connection, which must
            // never be reaped.
            Target::Memory => Self {
                max_size: 1,
                idle_timeout: None,
                max_lifetime: None,
            },
        }
    }
}

/// Shared handle to a SQLite database.
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    target: Target,
    options: EngineOptions,
    pool: DbPool,
}

impl Engine {
    /// Create an engine for a database file. No I/O happens here.
    pub fn file(path: impl AsRef<Path>, options: EngineOptions) -> Self {
        Self::build(Target::File(path.as_ref().to_path_buf()), options)
    }

    /// Create an engine for a private in-memory database.
    ///
    /// The database is held by a single pooled connection that is kept
    /// for the life of the engine, so every session sees the same data and
    /// separate engines stay isolated. Sessions take turns: one holding an
    /// open transaction makes the others wait for the connection.
    pub fn memory(options: EngineOptions) -> Self {
        Self::build(Target::Memory, options)
    }

    /// Create an engine from a SQLite URL.
    ///
    /// Accepted forms:
    ///
    /// * `sqlite://`, `sqlite:///` and `sqlite:///:memory:` - in-memory
    /// * `sqlite:///taxi.db` - relative to the working directory
    /// * `sqlite:////var/lib/taxi/taxi.db` - absolute path
    ///
    /// # Example
    ///
    /// ```
    /// use taxi_db::engine::{Engine, EngineOptions};
    ///
    /// let engine = Engine::from_url("sqlite:///taxi.db", EngineOptions::default()).unwrap();
    /// assert_eq!(engine.path().unwrap().to_str(), Some("taxi.db"));
    /// assert!(Engine::from_url("postgres://localhost/taxi", EngineOptions::default()).is_err());
    /// ```
    pub fn from_url(url: &str, options: EngineOptions) -> Result<Self> {
        let rest = url.strip_prefix("sqlite://").ok_or_else(|| {
            Error::invalid_input(format!(
                "unsupported database URL '{url}': expected sqlite:///<path>"
            ))
        })?;

        if rest.is_empty() {
            return Ok(Self::memory(options));
        }

        let path = rest.strip_prefix('/').ok_or_else(|| {
            Error::invalid_input(format!(
                "database URL '{url}' has a host component; use sqlite:///<path>"
            ))
        })?;

        match path {
            "" | ":memory:" => Ok(Self::memory(options)),
            path => Ok(Self::file(path, options)),
        }
    }

    fn build(target: Target, options: EngineOptions) -> Self {
        let manager = match &target {
            Target::File(path) => SqliteConnectionManager::file(path),
            Target::Memory => SqliteConnectionManager::memory(),
        };

        let wal = matches!(target, Target::File(_));
        let url = url_for(&target);
        let echo = options.echo;
        let manager = manager.with_init(move |conn| {
            tracing::debug!("Opening connection to {}", url);
            if echo {
                conn.trace(Some(echo_statement));
            }
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            if wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            Ok(())
        });

        // min_idle of zero keeps the pool from opening anything up front.
        let limits = PoolLimits::for_target(&target);
        let pool = Pool::builder()
            .max_size(limits.max_size)
            .min_idle(Some(0))
            .idle_timeout(limits.idle_timeout)
            .max_lifetime(limits.max_lifetime)
            .connection_timeout(CONNECT_TIMEOUT)
            .build_unchecked(manager);

        tracing::debug!(
            "Created engine for {} (echo={}, future={})",
            url_for(&target),
            options.echo,
            options.future
        );

        Self {
            inner: Arc::new(EngineInner {
                target,
                options,
                pool,
            }),
        }
    }

    /// The URL this engine targets, in `sqlite:///` form.
    pub fn url(&self) -> String {
        url_for(&self.inner.target)
    }

    /// The database file, or `None` for in-memory engines.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner.target {
            Target::File(path) => Some(path),
            Target::Memory => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.inner.target, Target::Memory)
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    /// Returns true if both handles share the same underlying engine.
    pub fn same_as(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Draw a connection, opening the database on demand.
    ///
    /// Failures to create or open the file surface here as
    /// [`Error::Database`].
    pub fn connect(&self) -> Result<EngineConnection> {
        self.inner.pool.get().map_err(Error::database)
    }

    /// Names of the user tables currently present in the database.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(Error::database)?;
        let names = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::database)?;
        Ok(names)
    }

    /// Version string of the linked SQLite library.
    pub fn sqlite_version(&self) -> Result<String> {
        let conn = self.connect()?;
        conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))
            .map_err(Error::database)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("url", &self.url())
            .field("options", &self.inner.options)
            .finish()
    }
}

fn url_for(target: &Target) -> String {
    match target {
        Target::File(path) => format!("sqlite:///{}", path.display()),
        Target::Memory => "sqlite://".to_string(),
    }
}

fn echo_statement(sql: &str) {
    tracing::info!(target: ECHO_TARGET, "{}", sql);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert!(!options.echo);
        assert!(options.future);
    }

    #[test]
    fn test_file_engine_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taxi.db");

        let engine = Engine::file(&path, EngineOptions::default());
        assert!(!path.exists());

        let _conn = engine.connect().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_url_parsing() {
        let options = EngineOptions::default();

        let engine = Engine::from_url("sqlite:///taxi.db", options).unwrap();
        assert_eq!(engine.path(), Some(Path::new("taxi.db")));
        assert_eq!(engine.url(), "sqlite:///taxi.db");

        let engine = Engine::from_url("sqlite:////var/lib/taxi/taxi.db", options).unwrap();
        assert_eq!(engine.path(), Some(Path::new("/var/lib/taxi/taxi.db")));
        assert_eq!(engine.url(), "sqlite:////var/lib/taxi/taxi.db");

        for url in ["sqlite://", "sqlite:///", "sqlite:///:memory:"] {
            let engine = Engine::from_url(url, options).unwrap();
            assert!(engine.is_memory(), "{url} should be in-memory");
            assert_eq!(engine.path(), None);
        }
    }

    #[test]
    fn test_malformed_urls() {
        let options = EngineOptions::default();
        for url in ["taxi.db", "postgres://localhost/taxi", "sqlite:/taxi.db", "sqlite://host/taxi.db"] {
            let err = Engine::from_url(url, options).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{url} should be rejected");
        }
    }

    #[test]
    fn test_connection_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::file(dir.path().join("taxi.db"), EngineOptions::default());
        let conn = engine.connect().unwrap();

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_memory_engines_are_isolated() {
        let a = Engine::memory(EngineOptions::default());
        let b = Engine::memory(EngineOptions::default());

        a.connect()
            .unwrap()
            .execute_batch("CREATE TABLE drivers (id INTEGER PRIMARY KEY)")
            .unwrap();

        // The table outlives the connection handle it was created on.
        assert_eq!(a.table_names().unwrap(), vec!["drivers".to_string()]);
        assert!(b.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_pool_limits() {
        let memory = PoolLimits::for_target(&Target::Memory);
        assert_eq!(memory.max_size, 1);
        assert_eq!(memory.idle_timeout, None);
        assert_eq!(memory.max_lifetime, None);

        let file = PoolLimits::for_target(&Target::File(PathBuf::from("taxi.db")));
        assert_eq!(file.max_size, POOL_SIZE);
        assert!(file.idle_timeout.is_some());

        let engine = Engine::memory(EngineOptions::default());
        assert_eq!(engine.inner.pool.max_size(), 1);
    }

    #[test]
    fn test_memory_connection_waits_for_release() {
        let engine = Engine::memory(EngineOptions::default());
        let conn = engine.connect().unwrap();
        conn.execute_batch("CREATE TABLE trips (id INTEGER PRIMARY KEY)")
            .unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| engine.table_names().unwrap());
            std::thread::sleep(Duration::from_millis(50));
            drop(conn);
            assert_eq!(waiter.join().unwrap(), vec!["trips".to_string()]);
        });
    }

    #[test]
    fn test_clones_share_engine() {
        let engine = Engine::memory(EngineOptions::default());
        let clone = engine.clone();
        assert!(engine.same_as(&clone));
        assert!(!engine.same_as(&Engine::memory(EngineOptions::default())));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn run_logged(echo: bool) -> String {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::file(
            dir.path().join("taxi.db"),
            EngineOptions { echo, future: true },
        );

        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let conn = engine.connect().unwrap();
            let answer: i64 = conn
                .query_row("SELECT 40 + 2 AS answer", [], |row| row.get(0))
                .unwrap();
            assert_eq!(answer, 42);
        });

        captured.text()
    }

    #[test]
    fn test_echo_logs_statements() {
        let output = run_logged(true);
        assert!(output.contains("SELECT 40 + 2 AS answer"), "{output}");
        assert!(output.contains(ECHO_TARGET), "{output}");
    }

    #[test]
    fn test_no_echo_by_default() {
        let output = run_logged(false);
        assert!(!output.contains("SELECT 40 + 2 AS answer"), "{output}");
    }

    #[test]
    fn test_unopenable_path_fails_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("taxi.db");

        // Construction succeeds; the failure is deferred to first use.
        let engine = Engine::file(&path, EngineOptions::default());
        let err = engine.connect().unwrap_err();
        assert!(err.is_database());
    }
}
