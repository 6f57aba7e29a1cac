//! Declarative schema registry.
//!
//! Entity types describe their table with a [`TableDef`] and implement
//! [`Entity`]. Registering them with a [`DeclarativeBase`] makes their
//! schema known so the base can create, drop, or reflect the tables on an
//! [`Engine`].

use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::types::Value;
use rusqlite::Row;
use taxi_core::{Error, Result};

use crate::engine::Engine;

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Real,
    Text,
    Blob,
}

impl DataType {
    fn as_sql(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Text => "TEXT",
            DataType::Blob => "BLOB",
        }
    }
}

/// Column default.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
    CurrentTimestamp,
}

impl DefaultValue {
    fn as_sql(&self) -> String {
        match self {
            DefaultValue::Integer(v) => v.to_string(),
            DefaultValue::Real(v) => v.to_string(),
            DefaultValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
    pub not_null: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            primary_key: false,
            not_null: false,
            unique: false,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type.as_sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(ref default) = self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.as_sql());
        }
        sql
    }
}

/// Referential action for a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    NoAction,
    Cascade,
    SetNull,
    Restrict,
}

impl ForeignKeyAction {
    fn as_sql(self) -> &'static str {
        match self {
            ForeignKeyAction::NoAction => "NO ACTION",
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: ForeignKeyAction,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            on_delete: ForeignKeyAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }
}

/// Schema of one table.
///
/// # Example
///
/// ```
/// use taxi_db::base::{Column, DataType, TableDef};
///
/// let table = TableDef::new("drivers")
///     .column(Column::new("id", DataType::Integer).primary_key())
///     .column(Column::new("name", DataType::Text).not_null());
///
/// assert_eq!(
///     table.create_sql(),
///     r#"CREATE TABLE IF NOT EXISTS "drivers" ("id" INTEGER PRIMARY KEY, "name" TEXT NOT NULL)"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Index of the primary key column, if any.
    pub fn primary_key_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.primary_key)
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.primary_key_index().map(|i| &self.columns[i])
    }

    /// Check the definition is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_input("table name cannot be empty"));
        }
        if self.columns.is_empty() {
            return Err(Error::invalid_input(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::invalid_input(format!(
                    "table '{}' declares column '{}' twice",
                    self.name, column.name
                )));
            }
        }
        if self.columns.iter().filter(|c| c.primary_key).count() > 1 {
            return Err(Error::invalid_input(format!(
                "table '{}' declares more than one primary key column",
                self.name
            )));
        }
        for fk in &self.foreign_keys {
            if !self.columns.iter().any(|c| c.name == fk.column) {
                return Err(Error::invalid_input(format!(
                    "foreign key on '{}' references unknown column '{}'",
                    self.name, fk.column
                )));
            }
        }
        Ok(())
    }

    /// Quoted, comma separated column names in declaration order.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(Column::definition_sql).collect();
        for fk in &self.foreign_keys {
            let mut clause = format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                quote_ident(&fk.column),
                quote_ident(&fk.references_table),
                quote_ident(&fk.references_column)
            );
            if fk.on_delete != ForeignKeyAction::NoAction {
                clause.push_str(" ON DELETE ");
                clause.push_str(fk.on_delete.as_sql());
            }
            parts.push(clause);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            parts.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_ident(&self.name))
    }

    pub(crate) fn insert_sql(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.name),
            self.column_list(),
            placeholders
        )
    }

    pub(crate) fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {}",
            self.column_list(),
            quote_ident(&self.name)
        )
    }

    pub(crate) fn require_primary_key(&self) -> Result<(usize, &Column)> {
        let index = self.primary_key_index().ok_or_else(|| {
            Error::invalid_input(format!("table '{}' has no primary key", self.name))
        })?;
        Ok((index, &self.columns[index]))
    }
}

/// A persistent type mapped onto one table.
///
/// `values` must yield one value per column of `table()`, in the same
/// order, and `from_row` reads columns in that order too.
pub trait Entity: Sized {
    fn table() -> TableDef;

    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Registry that entity schemas attach to.
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct DeclarativeBase {
    registry: Arc<RwLock<Vec<TableDef>>>,
}

impl DeclarativeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity's table.
    ///
    /// Registering the same definition twice is a no-op; a different
    /// definition under an existing name is a conflict.
    pub fn register<E: Entity>(&self) -> Result<()> {
        self.register_table(E::table())
    }

    pub fn register_table(&self, table: TableDef) -> Result<()> {
        table.validate()?;

        let mut registry = self.registry.write();
        if let Some(existing) = registry.iter().find(|t| t.name == table.name) {
            if *existing == table {
                return Ok(());
            }
            return Err(Error::conflict(format!(
                "table '{}' is already registered with a different definition",
                table.name
            )));
        }

        tracing::debug!("Registered table {}", table.name);
        registry.push(table);
        Ok(())
    }

    /// Registered tables, in registration order.
    pub fn tables(&self) -> Vec<TableDef> {
        self.registry.read().clone()
    }

    pub fn table(&self, name: &str) -> Option<TableDef> {
        self.registry.read().iter().find(|t| t.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.read().iter().any(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Returns true if both handles share the same registry.
    pub fn same_as(&self, other: &DeclarativeBase) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
    }

    /// Create every registered table that does not exist yet.
    ///
    /// Runs in a single transaction, in registration order.
    pub fn create_all(&self, engine: &Engine) -> Result<()> {
        let tables = self.tables();
        let mut conn = engine.connect()?;
        let tx = conn.transaction().map_err(Error::database)?;
        for table in &tables {
            tx.execute_batch(&table.create_sql())
                .map_err(Error::database)?;
        }
        tx.commit().map_err(Error::database)?;

        tracing::info!("Ensured {} tables on {}", tables.len(), engine.url());
        Ok(())
    }

    /// Drop every registered table, in reverse registration order.
    pub fn drop_all(&self, engine: &Engine) -> Result<()> {
        let tables = self.tables();
        let mut conn = engine.connect()?;
        let tx = conn.transaction().map_err(Error::database)?;
        for table in tables.iter().rev() {
            tx.execute_batch(&table.drop_sql())
                .map_err(Error::database)?;
        }
        tx.commit().map_err(Error::database)?;

        tracing::info!("Dropped {} tables on {}", tables.len(), engine.url());
        Ok(())
    }

    /// Registered tables that currently exist in the database.
    pub fn reflect(&self, engine: &Engine) -> Result<Vec<String>> {
        let existing = engine.table_names()?;
        Ok(self
            .registry
            .read()
            .iter()
            .filter(|t| existing.contains(&t.name))
            .map(|t| t.name.clone())
            .collect())
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
