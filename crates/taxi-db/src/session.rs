//! Session factory and unit-of-work sessions.
//!
//! A [`SessionFactory`] is bound to one [`Engine`] and hands out
//! [`Session`]s. A session stages writes in memory and only sends them to
//! the database on [`Session::flush`] or [`Session::commit`] (or before a
//! query, when `autoflush` is enabled).
//!
//! Queries run on a pooled connection outside any transaction until the
//! session writes. The first flush takes the write lock with
//! `BEGIN IMMEDIATE` and the session keeps that connection, and reads
//! through it, until `commit` or `rollback` returns it to the pool. In
//! future mode (the default) nothing is persisted until `commit`; dropping
//! a session with an open transaction rolls it back.

use std::fmt;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Params, Row, ToSql};
use serde::{Deserialize, Serialize};
use taxi_core::{Error, Result};

use crate::base::{quote_ident, Entity};
use crate::engine::{Engine, EngineConnection};

/// Session behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Flush staged writes before every query.
    pub autoflush: bool,
    /// Autobegin a transaction and require an explicit commit.
    ///
    /// When false, each flush commits immediately.
    pub future: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autoflush: false,
            future: true,
        }
    }
}

/// Produces sessions bound to one engine.
///
/// Cloning is cheap; all clones share one configuration.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

#[derive(Debug)]
struct FactoryInner {
    bind: Engine,
    options: SessionOptions,
}

impl SessionFactory {
    pub fn new(bind: Engine, options: SessionOptions) -> Self {
        if options.future && !bind.options().future {
            tracing::warn!(
                "Session factory requests future mode on a legacy engine ({})",
                bind.url()
            );
        }
        Self {
            inner: Arc::new(FactoryInner { bind, options }),
        }
    }

    /// Open a new session. No connection is drawn until it is needed.
    pub fn session(&self) -> Session {
        Session {
            engine: self.inner.bind.clone(),
            options: self.inner.options,
            conn: None,
            staged: Vec::new(),
        }
    }

    /// The engine every produced session targets.
    pub fn engine(&self) -> &Engine {
        &self.inner.bind
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options
    }

    /// Returns true if both handles share the same factory.
    pub fn same_as(&self, other: &SessionFactory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct StagedWrite {
    sql: String,
    params: Vec<Value>,
}

/// A unit of work against one engine.
pub struct Session {
    engine: Engine,
    options: SessionOptions,
    conn: Option<EngineConnection>,
    staged: Vec<StagedWrite>,
}

impl Session {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Number of staged writes not yet flushed.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Whether the session holds a connection (an open write transaction).
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Whether a database transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.conn
            .as_deref()
            .map(|conn| !conn.is_autocommit())
            .unwrap_or(false)
    }

    /// Stage an insert of `entity`.
    pub fn add<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let table = E::table();
        let values = entity_values(entity, table.columns.len(), &table.name)?;
        self.staged.push(StagedWrite {
            sql: table.insert_sql(),
            params: values,
        });
        Ok(())
    }

    /// Stage an update of `entity`, matched by primary key.
    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let table = E::table();
        let (pk_index, pk) = table.require_primary_key()?;
        let mut values = entity_values(entity, table.columns.len(), &table.name)?;

        let key = values.remove(pk_index);
        let assignments = table
            .columns
            .iter()
            .filter(|c| !c.primary_key)
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(&c.name), i + 1))
            .collect::<Vec<_>>();
        if assignments.is_empty() {
            return Err(Error::invalid_input(format!(
                "table '{}' has no columns to update",
                table.name
            )));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(&table.name),
            assignments.join(", "),
            quote_ident(&pk.name),
            values.len() + 1
        );
        values.push(key);
        self.staged.push(StagedWrite {
            sql,
            params: values,
        });
        Ok(())
    }

    /// Stage a delete of the `E` row with primary key `key`.
    pub fn delete<E: Entity>(&mut self, key: impl Into<Value>) -> Result<()> {
        let table = E::table();
        let (_, pk) = table.require_primary_key()?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&table.name),
            quote_ident(&pk.name)
        );
        self.staged.push(StagedWrite {
            sql,
            params: vec![key.into()],
        });
        Ok(())
    }

    /// Stage an arbitrary write statement.
    pub fn stage(&mut self, sql: impl Into<String>, params: Vec<Value>) {
        self.staged.push(StagedWrite {
            sql: sql.into(),
            params,
        });
    }

    /// Send staged writes to the database, in order.
    ///
    /// Returns the number of statements executed. If any statement fails
    /// the transaction is rolled back and the staged writes are discarded.
    pub fn flush(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        self.begin_write()?;
        let staged = std::mem::take(&mut self.staged);
        let result = match self.conn.as_deref() {
            Some(conn) => apply(conn, &staged),
            None => Err(Error::internal("session has no connection")),
        };

        if let Err(e) = result {
            self.abort();
            return Err(e);
        }

        tracing::trace!("Flushed {} statements", staged.len());
        if !self.options.future {
            self.finish("COMMIT")?;
        }
        Ok(staged.len())
    }

    /// Flush, then commit the open transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.flush()?;
        if self.conn.is_some() {
            self.finish("COMMIT")?;
            tracing::debug!("Session committed on {}", self.engine.url());
        }
        Ok(())
    }

    /// Discard staged writes and roll back the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        let discarded = self.staged.len();
        self.staged.clear();
        if self.conn.is_some() {
            self.finish("ROLLBACK")?;
        }
        tracing::debug!("Session rolled back ({} staged writes discarded)", discarded);
        Ok(())
    }

    /// Roll back anything uncommitted and return the connection to the pool.
    pub fn close(mut self) -> Result<()> {
        self.rollback()
    }

    /// Load one `E` by primary key.
    pub fn get<E: Entity>(&mut self, key: impl ToSql) -> Result<Option<E>> {
        let table = E::table();
        let (_, pk) = table.require_primary_key()?;
        let sql = format!("{} WHERE {} = ?1", table.select_sql(), quote_ident(&pk.name));
        self.query_row(&sql, [key], E::from_row)
    }

    /// Load every `E`, in insertion order.
    pub fn all<E: Entity>(&mut self) -> Result<Vec<E>> {
        let sql = format!("{} ORDER BY rowid", E::table().select_sql());
        self.query_map(&sql, [], E::from_row)
    }

    /// Run a query expected to return at most one row.
    pub fn query_row<T, P, F>(&mut self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.read(|conn| {
            conn.query_row(sql, params, f)
                .optional()
                .map_err(Error::database)
        })
    }

    /// Run a query and map every row.
    pub fn query_map<T, P, F>(&mut self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.read(|conn| {
            let mut stmt = conn.prepare(sql).map_err(Error::database)?;
            let rows = stmt.query_map(params, f).map_err(Error::database)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::database)
        })
    }

    /// Run `f` inside the open transaction, or on a connection borrowed
    /// from the pool for just this read.
    fn read<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.options.autoflush {
            self.flush()?;
        }
        match self.conn.as_deref() {
            Some(conn) => f(conn),
            None => {
                let conn = self.engine.connect()?;
                f(&conn)
            }
        }
    }

    /// Take the write lock, unless this session already holds it.
    fn begin_write(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.engine.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(Error::database)?;
        self.conn = Some(conn);
        tracing::trace!("Session began transaction");
        Ok(())
    }

    /// Run `COMMIT` or `ROLLBACK` and release the connection.
    ///
    /// A failed `COMMIT` keeps the transaction open so the caller can
    /// retry or roll back.
    fn finish(&mut self, statement: &str) -> Result<()> {
        if let Some(conn) = self.conn.as_deref() {
            if !conn.is_autocommit() {
                conn.execute_batch(statement).map_err(Error::database)?;
            }
        }
        self.conn = None;
        Ok(())
    }

    /// Best-effort rollback that always releases the connection.
    fn abort(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!("Failed to roll back session: {}", e);
                }
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine.url())
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .field("pending", &self.staged.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::debug!("Discarding {} staged writes", self.staged.len());
        }
        self.abort();
    }
}

fn entity_values<E: Entity>(entity: &E, columns: usize, table: &str) -> Result<Vec<Value>> {
    let values = entity.values();
    if values.len() != columns {
        return Err(Error::invalid_input(format!(
            "entity for '{}' produced {} values for {} columns",
            table,
            values.len(),
            columns
        )));
    }
    Ok(values)
}

fn apply(conn: &Connection, staged: &[StagedWrite]) -> Result<()> {
    for write in staged {
        conn.execute(&write.sql, rusqlite::params_from_iter(write.params.iter()))
            .map_err(Error::database)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Column, DataType, TableDef};
    use crate::engine::EngineOptions;

    #[derive(Debug, Clone, PartialEq)]
    struct Rider {
        id: i64,
        name: String,
    }

    impl Entity for Rider {
        fn table() -> TableDef {
            TableDef::new("riders")
                .column(Column::new("id", DataType::Integer).primary_key())
                .column(Column::new("name", DataType::Text).not_null())
        }

        fn values(&self) -> Vec<Value> {
            vec![Value::Integer(self.id), Value::Text(self.name.clone())]
        }

        fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        }
    }

    fn factory(options: SessionOptions) -> (tempfile::TempDir, SessionFactory) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::file(dir.path().join("taxi.db"), EngineOptions::default());
        let conn = engine.connect().unwrap();
        conn.execute_batch(&Rider::table().create_sql()).unwrap();
        (dir, SessionFactory::new(engine, options))
    }

    fn rider(id: i64, name: &str) -> Rider {
        Rider {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert!(!options.autoflush);
        assert!(options.future);
    }

    #[test]
    fn test_session_is_lazy() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        session.add(&rider(1, "Ada")).unwrap();

        assert!(!session.is_connected());
        assert_eq!(session.pending(), 1);
    }

    #[test]
    fn test_reads_do_not_hold_a_connection() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        assert!(session.all::<Rider>().unwrap().is_empty());
        assert!(!session.is_connected());

        session.add(&rider(1, "Ada")).unwrap();
        session.flush().unwrap();
        assert!(session.is_connected());
        assert!(session.in_transaction());

        session.commit().unwrap();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_sessions_share_engine() {
        let (_dir, factory) = factory(SessionOptions::default());
        let a = factory.session();
        let b = factory.session();
        assert!(a.engine().same_as(b.engine()));
        assert!(a.engine().same_as(factory.engine()));
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        session.add(&rider(1, "Ada")).unwrap();
        session.add(&rider(2, "Grace")).unwrap();
        session.commit().unwrap();

        session.update(&rider(1, "Ada L.")).unwrap();
        session.delete::<Rider>(2).unwrap();
        session.commit().unwrap();

        assert_eq!(session.all::<Rider>().unwrap(), vec![rider(1, "Ada L.")]);
        assert_eq!(session.get::<Rider>(2).unwrap(), None);
    }

    #[test]
    fn test_rollback_discards_flushed_writes() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        session.add(&rider(1, "Ada")).unwrap();
        session.flush().unwrap();
        assert!(session.in_transaction());
        assert_eq!(session.all::<Rider>().unwrap().len(), 1);

        session.rollback().unwrap();
        assert!(!session.in_transaction());
        assert!(session.all::<Rider>().unwrap().is_empty());
    }

    #[test]
    fn test_flush_error_rolls_back() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        session.add(&rider(1, "Ada")).unwrap();
        session.add(&rider(1, "Duplicate")).unwrap();

        let err = session.flush().unwrap_err();
        assert!(err.is_database());
        assert_eq!(session.pending(), 0);
        assert!(!session.in_transaction());

        let mut fresh = factory.session();
        assert!(fresh.all::<Rider>().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_mode_commits_on_flush() {
        let (_dir, factory) = factory(SessionOptions {
            autoflush: false,
            future: false,
        });
        let mut session = factory.session();
        session.add(&rider(1, "Ada")).unwrap();
        session.flush().unwrap();
        assert!(!session.in_transaction());
        assert!(!session.is_connected());
        drop(session);

        let mut other = factory.session();
        assert_eq!(other.get::<Rider>(1).unwrap(), Some(rider(1, "Ada")));
    }

    #[test]
    fn test_wrong_value_count_is_rejected() {
        struct Broken;

        impl Entity for Broken {
            fn table() -> TableDef {
                Rider::table()
            }

            fn values(&self) -> Vec<Value> {
                vec![Value::Integer(1)]
            }

            fn from_row(_row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Broken)
            }
        }

        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        let err = session.add(&Broken).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_stage_raw_statement() {
        let (_dir, factory) = factory(SessionOptions::default());
        let mut session = factory.session();
        session.stage(
            "INSERT INTO riders (id, name) VALUES (?1, ?2)",
            vec![Value::Integer(7), Value::Text("Edsger".into())],
        );
        session.commit().unwrap();

        let name = session
            .query_row("SELECT name FROM riders WHERE id = ?1", [7], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some("Edsger"));
    }
}
