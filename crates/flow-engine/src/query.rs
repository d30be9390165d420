//! Embedded analytical query backend
//!
//! A lazily-initialized in-memory SQLite connection shared by query
//! operators. Calls take the connection mutex for the duration of one
//! statement, so queries are implicitly serialized. A failing query
//! drops the connection instead of leaving it poisoned; the next call
//! reopens a fresh one.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};

use crate::error::{EngineError, Result};

static SHARED: Lazy<QueryBackend> = Lazy::new(QueryBackend::new);

/// Shared embedded query backend
pub struct QueryBackend {
    conn: Mutex<Option<Connection>>,
}

impl QueryBackend {
    fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    /// The process-wide instance
    pub fn shared() -> &'static QueryBackend {
        &SHARED
    }

    /// Run a SELECT and return rows as an array of column-keyed objects
    pub fn query(&self, sql: &str) -> Result<Value> {
        let mut guard = self.conn.lock();
        let conn = Self::ensure_open(&mut guard)?;
        match Self::run_query(conn, sql) {
            Ok(rows) => Ok(rows),
            Err(err) => {
                // Reset rather than leave a possibly-wedged connection
                *guard = None;
                Err(err)
            }
        }
    }

    /// Run a statement that returns no rows (DDL, INSERT); yields the
    /// affected row count.
    pub fn execute(&self, sql: &str) -> Result<usize> {
        let mut guard = self.conn.lock();
        let conn = Self::ensure_open(&mut guard)?;
        match conn.execute(sql, []) {
            Ok(count) => Ok(count),
            Err(err) => {
                *guard = None;
                Err(EngineError::Query(err.to_string()))
            }
        }
    }

    fn ensure_open<'a>(guard: &'a mut Option<Connection>) -> Result<&'a Connection> {
        if guard.is_none() {
            let conn = Connection::open_in_memory()
                .map_err(|e| EngineError::Query(e.to_string()))?;
            log::debug!("opened in-memory query backend");
            *guard = Some(conn);
        }
        guard
            .as_ref()
            .ok_or_else(|| EngineError::Query("connection unavailable".to_string()))
    }

    fn run_query(conn: &Connection, sql: &str) -> Result<Value> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| EngineError::Query(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt
            .query([])
            .map_err(|e| EngineError::Query(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| EngineError::Query(e.to_string()))? {
            let mut object = Map::new();
            for (i, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| EngineError::Query(e.to_string()))?;
                object.insert(column.clone(), Self::to_json(value));
            }
            out.push(Value::Object(object));
        }
        Ok(Value::Array(out))
    }

    fn to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Number(i.into()),
            ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        }
    }
}
