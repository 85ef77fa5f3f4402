use crate::error::{DalError, Result};
use crate::schema::{ColumnDef, ColumnKind, SchemaIndex, TableInfo, TableKind, SINGLETONS_TABLE};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// One row of a list-backed table, or of the singletons table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub key: Option<String>,
    pub document: Value,
}

/// The relational side of the datastore: one SQLite connection holding the
/// singletons table plus one table per schema list.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create the database file at the given path.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Storage { conn })
    }

    /// Create the singletons table and one table per list in the index.
    pub fn create_tables(&self, index: &SchemaIndex) -> Result<()> {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                document TEXT NOT NULL
            );\n",
            quote(SINGLETONS_TABLE)
        );

        // BTreeMap order puts every parent table before its children.
        for table in index.tables.values() {
            let Some(parent) = &table.parent else { continue };
            let parent_name = index
                .tables
                .get(parent)
                .map(|t| t.name.as_str())
                .ok_or_else(|| DalError::Schema(format!("No table for {parent}")))?;
            ddl.push_str(&table_ddl(table, parent_name));
        }

        self.conn.execute_batch(&ddl)?;
        Ok(())
    }

    // ── Singletons ───────────────────────────────────────────────────

    /// Get a well-known row by name.
    pub fn get_singleton(&self, name: &str) -> Result<Option<Row>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT row_id, document FROM {} WHERE name = ?1",
                    quote(SINGLETONS_TABLE)
                ),
                params![name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((id, document)) => Ok(Some(Row {
                id,
                parent_id: None,
                key: Some(name.to_string()),
                document: serde_json::from_str(&document)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert or replace a well-known row, returning its row id.
    pub fn put_singleton(&self, name: &str, document: &Value) -> Result<i64> {
        let table = quote(SINGLETONS_TABLE);
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (name, document) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET document = excluded.document"
            ),
            params![name, serde_json::to_string(document)?],
        )?;
        let id = self.conn.query_row(
            &format!("SELECT row_id FROM {table} WHERE name = ?1"),
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Load the document column of a row in the root or a config table.
    pub fn load_document(&self, table: &TableInfo, row_id: i64) -> Result<Value> {
        ensure_document_table(table)?;
        let document: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT document FROM {} WHERE row_id = ?1",
                    quote(&table.name)
                ),
                params![row_id],
                |row| row.get(0),
            )
            .optional()?;
        match document {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Err(DalError::NodeNotFound(format!(
                "row {row_id} of {}",
                table.schema_path
            ))),
        }
    }

    pub fn update_document(&self, table: &TableInfo, row_id: i64, document: &Value) -> Result<()> {
        ensure_document_table(table)?;
        self.conn.execute(
            &format!(
                "UPDATE {} SET document = ?1 WHERE row_id = ?2",
                quote(&table.name)
            ),
            params![serde_json::to_string(document)?, row_id],
        )?;
        Ok(())
    }

    // ── Config rows ──────────────────────────────────────────────────

    /// Insert a config list entry. A duplicate key is `NodeAlreadyExists`.
    pub fn insert_row(
        &self,
        table: &TableInfo,
        parent_id: i64,
        key: &str,
        document: &Value,
    ) -> Result<i64> {
        let key_field = config_key(table)?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {} (parent_id, {}, document) VALUES (?1, ?2, ?3)",
                quote(&table.name),
                quote(key_field)
            ),
            params![parent_id, key, serde_json::to_string(document)?],
        );

        match result {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                log::debug!("Inserted {}={} as row {}", table.schema_path, key, id);
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(DalError::NodeAlreadyExists(format!(
                    "{}={}",
                    table.schema_path, key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find a config row by key under a parent. Globally unique tables are
    /// searched by key alone, so an entry living under another parent is
    /// reported as absent.
    pub fn find_row(&self, table: &TableInfo, parent_id: i64, key: &str) -> Result<Option<i64>> {
        if is_globally_unique(table) {
            return Ok(self
                .find_by_key(table, key)?
                .filter(|(_, owner)| *owner == parent_id)
                .map(|(id, _)| id));
        }

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT row_id FROM {} WHERE {} = ?1 AND parent_id = ?2",
                    quote(&table.name),
                    quote(config_key(table)?)
                ),
                params![key, parent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Find a row of a globally unique table by key alone, returning
    /// `(row_id, parent_id)`. More than one match is `TooManyNodesFound`.
    pub fn find_by_key(&self, table: &TableInfo, key: &str) -> Result<Option<(i64, i64)>> {
        if !is_globally_unique(table) {
            return Err(DalError::InvalidTarget(format!(
                "{} is not keyed globally",
                table.schema_path
            )));
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT row_id, parent_id FROM {} WHERE {} = ?1",
            quote(&table.name),
            quote(config_key(table)?)
        ))?;
        let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let matches: Vec<(i64, i64)> = rows.collect::<std::result::Result<_, _>>()?;

        match matches.as_slice() {
            [] => Ok(None),
            [found] => Ok(Some(*found)),
            _ => Err(DalError::TooManyNodesFound {
                table: table.name.clone(),
                key: key.to_string(),
            }),
        }
    }

    /// Config rows owned by `parent_id`, in insertion order.
    pub fn rows_for_parent(&self, table: &TableInfo, parent_id: i64) -> Result<Vec<Row>> {
        let key_field = config_key(table)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT row_id, {}, document FROM {} WHERE parent_id = ?1 ORDER BY row_id",
            quote(key_field),
            quote(&table.name)
        ))?;
        let rows = stmt.query_map(params![parent_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, key, document) = row?;
            result.push(Row {
                id,
                parent_id: Some(parent_id),
                key: Some(key),
                document: serde_json::from_str(&document)?,
            });
        }
        Ok(result)
    }

    /// Keys of the config rows owned by `parent_id`, in insertion order.
    pub fn keys_for_parent(&self, table: &TableInfo, parent_id: i64) -> Result<Vec<String>> {
        let key_field = config_key(table)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE parent_id = ?1 ORDER BY row_id",
            quote(key_field),
            quote(&table.name)
        ))?;
        let keys = stmt.query_map(params![parent_id], |row| row.get(0))?;
        Ok(keys.collect::<std::result::Result<_, _>>()?)
    }

    /// Row ids owned by `parent_id` in any list table.
    pub fn row_ids_for_parent(&self, table: &TableInfo, parent_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT row_id FROM {} WHERE parent_id = ?1 ORDER BY row_id",
            quote(&table.name)
        ))?;
        let ids = stmt.query_map(params![parent_id], |row| row.get(0))?;
        Ok(ids.collect::<std::result::Result<_, _>>()?)
    }

    /// Parent row id and key of a config row.
    pub fn parent_and_key(&self, table: &TableInfo, row_id: i64) -> Result<Option<(i64, String)>> {
        let key_field = config_key(table)?;
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT parent_id, {} FROM {} WHERE row_id = ?1",
                    quote(key_field),
                    quote(&table.name)
                ),
                params![row_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn delete_row(&self, table: &TableInfo, row_id: i64) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE row_id = ?1", quote(&table.name)),
            params![row_id],
        )?;
        log::debug!("Deleted row {} of {}", row_id, table.schema_path);
        Ok(())
    }

    /// Bulk delete every row owned by `parent_id`, returning the count.
    pub fn delete_rows_for_parent(&self, table: &TableInfo, parent_id: i64) -> Result<usize> {
        let count = self.conn.execute(
            &format!("DELETE FROM {} WHERE parent_id = ?1", quote(&table.name)),
            params![parent_id],
        )?;
        if count > 0 {
            log::debug!("Deleted {} rows of {}", count, table.schema_path);
        }
        Ok(count)
    }

    pub fn count_rows(&self, table: &TableInfo) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&table.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ── Operational rows ─────────────────────────────────────────────

    /// Append an operational list entry, one typed column per leaf.
    pub fn insert_operational(
        &self,
        table: &TableInfo,
        parent_id: i64,
        entry: &Map<String, Value>,
    ) -> Result<i64> {
        let columns = operational_columns(table)?;
        if let Some(unknown) = entry.keys().find(|k| !columns.iter().any(|c| &c.name == *k)) {
            return Err(DalError::MalformedBody(format!(
                "'{unknown}' is not a member of {}",
                table.schema_path
            )));
        }

        let mut names = vec!["parent_id".to_string()];
        let mut values = vec![SqlValue::Integer(parent_id)];
        for column in columns {
            if let Some(value) = entry.get(&column.name) {
                names.push(quote(&column.name));
                values.push(to_sql(column, value, &table.schema_path)?);
            }
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(&table.name),
                names.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Operational entries owned by `parent_id`, rebuilt from their columns.
    /// NULL columns and empty JSON arrays are left out.
    pub fn operational_rows(&self, table: &TableInfo, parent_id: i64) -> Result<Vec<Value>> {
        let columns = operational_columns(table)?;
        if columns.is_empty() {
            return Ok(self
                .row_ids_for_parent(table, parent_id)?
                .into_iter()
                .map(|_| Value::Object(Map::new()))
                .collect());
        }

        let select: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE parent_id = ?1 ORDER BY row_id",
            select.join(", "),
            quote(&table.name)
        ))?;
        let mut rows = stmt.query(params![parent_id])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let mut entry = Map::new();
            for (i, column) in columns.iter().enumerate() {
                let raw: SqlValue = row.get(i)?;
                if let Some(value) = from_sql(column, raw)? {
                    entry.insert(column.name.clone(), value);
                }
            }
            entries.push(Value::Object(entry));
        }
        Ok(entries)
    }

    // ── Transaction Support ──────────────────────────────────────────

    /// Begin a write transaction, taking the database write lock up front.
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn begin_read_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN DEFERRED")?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `f` in a write transaction: commit on success, roll back on error.
    pub fn transaction<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        self.finish(f)
    }

    /// Run `f` in a read transaction so every query sees one snapshot.
    pub fn read_transaction<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        self.begin_read_transaction()?;
        self.finish(f)
    }

    /// Commit after `f`. An error, a failed commit or a panic rolls back.
    fn finish<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        let guard = RollbackGuard { storage: self };
        let value = f(self)?;
        self.commit_transaction()?;
        std::mem::forget(guard);
        Ok(value)
    }
}

/// Rolls back the open transaction unless forgotten after a commit.
struct RollbackGuard<'a> {
    storage: &'a Storage,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        // SQLite may already have rolled back on its own.
        if self.storage.conn.is_autocommit() {
            return;
        }
        if let Err(e) = self.storage.rollback_transaction() {
            log::warn!("Rollback failed: {e}");
        }
    }
}

/// Double-quote an SQL identifier.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn table_ddl(table: &TableInfo, parent_name: &str) -> String {
    let name = quote(&table.name);
    let mut columns = vec![
        "row_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        format!(
            "parent_id INTEGER NOT NULL REFERENCES {}(row_id)",
            quote(parent_name)
        ),
    ];

    match &table.kind {
        TableKind::Root => {}
        TableKind::Config {
            key,
            globally_unique,
        } => {
            columns.push(format!("{} TEXT NOT NULL", quote(key)));
            columns.push("document TEXT NOT NULL".to_string());
            if *globally_unique {
                columns.push(format!("UNIQUE ({})", quote(key)));
            } else {
                columns.push(format!("UNIQUE ({}, parent_id)", quote(key)));
            }
        }
        TableKind::Operational { columns: leaves } => {
            for leaf in leaves {
                let sql_type = match leaf.kind {
                    ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
                    ColumnKind::Text | ColumnKind::DateTime | ColumnKind::Json => "TEXT",
                };
                columns.push(format!("{} {}", quote(&leaf.name), sql_type));
            }
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    {}\n);\nCREATE INDEX IF NOT EXISTS {} ON {name}(parent_id);\n",
        columns.join(",\n    "),
        quote(&format!("{}_parent", table.name)),
    )
}

fn ensure_document_table(table: &TableInfo) -> Result<()> {
    match table.kind {
        TableKind::Operational { .. } => Err(DalError::InvalidTarget(format!(
            "{} holds operational rows, not documents",
            table.schema_path
        ))),
        _ => Ok(()),
    }
}

fn is_globally_unique(table: &TableInfo) -> bool {
    matches!(
        table.kind,
        TableKind::Config {
            globally_unique: true,
            ..
        }
    )
}

fn config_key(table: &TableInfo) -> Result<&str> {
    table.key_field().ok_or_else(|| {
        DalError::InvalidTarget(format!("{} is not a keyed list", table.schema_path))
    })
}

fn operational_columns(table: &TableInfo) -> Result<&[ColumnDef]> {
    match &table.kind {
        TableKind::Operational { columns } => Ok(columns),
        _ => Err(DalError::InvalidTarget(format!(
            "{} is not an operational list",
            table.schema_path
        ))),
    }
}

/// Normalize a date-and-time leaf to UTC with second precision.
pub fn normalize_date_time(text: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn to_sql(column: &ColumnDef, value: &Value, schema_path: &str) -> Result<SqlValue> {
    let bad = || {
        DalError::MalformedBody(format!(
            "'{}' of {schema_path} has an invalid value {value}",
            column.name
        ))
    };

    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let sql = match column.kind {
        ColumnKind::Text => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) => SqlValue::Integer(n.as_i64().ok_or_else(bad)?),
            Value::String(s) => SqlValue::Integer(s.parse().map_err(|_| bad())?),
            _ => return Err(bad()),
        },
        ColumnKind::Boolean => SqlValue::Integer(value.as_bool().ok_or_else(bad)? as i64),
        ColumnKind::DateTime => {
            let text = value.as_str().ok_or_else(bad)?;
            SqlValue::Text(normalize_date_time(text).ok_or_else(bad)?)
        }
        ColumnKind::Json => SqlValue::Text(serde_json::to_string(value)?),
    };
    Ok(sql)
}

fn from_sql(column: &ColumnDef, raw: SqlValue) -> Result<Option<Value>> {
    let value = match (column.kind, raw) {
        (_, SqlValue::Null) => None,
        (ColumnKind::Json, SqlValue::Text(text)) => {
            let value: Value = serde_json::from_str(&text)?;
            match &value {
                Value::Array(items) if items.is_empty() => None,
                _ => Some(value),
            }
        }
        (ColumnKind::Boolean, SqlValue::Integer(i)) => Some(Value::Bool(i != 0)),
        (_, SqlValue::Integer(i)) => Some(Value::from(i)),
        (_, SqlValue::Real(f)) => Some(Value::from(f)),
        (_, SqlValue::Text(text)) => Some(Value::String(text)),
        (_, SqlValue::Blob(_)) => {
            return Err(DalError::Other(format!(
                "Unexpected blob in column '{}'",
                column.name
            )))
        }
    };
    Ok(value)
}
