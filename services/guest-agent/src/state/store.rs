//! SQLite-backed side-store.
//!
//! Every value is stored as JSON under `(path, name)`: multi-string values
//! as arrays, single strings as JSON strings. Read-modify-write operations
//! run inside an immediate transaction so they cannot interleave with
//! another writer of the same database.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

/// Errors from side-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid stored value at {path}\\{name}: {source}")]
    Encoding {
        path: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Side-store lock poisoned")]
    Poisoned,
}

/// Durable key/value storage partitioned by path.
///
/// Missing keys read as empty. Implementations must be safe to share
/// between reconcilers.
pub trait SideStore: Send + Sync {
    /// Read a multi-string value.
    fn get_multi(&self, path: &str, name: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically rewrite a multi-string value.
    fn update_multi(
        &self,
        path: &str,
        name: &str,
        update: &mut dyn FnMut(&mut Vec<String>),
    ) -> Result<(), StoreError>;

    /// Read a single string value.
    fn get_string(&self, path: &str, name: &str) -> Result<Option<String>, StoreError>;

    /// Write a single string value.
    fn set_string(&self, path: &str, name: &str, value: &str) -> Result<(), StoreError>;

    /// Replace a multi-string value.
    fn set_multi(&self, path: &str, name: &str, values: &[String]) -> Result<(), StoreError> {
        self.update_multi(path, name, &mut |current: &mut Vec<String>| {
            *current = values.to_vec()
        })
    }

    /// Append a value unless already present.
    fn add_multi(&self, path: &str, name: &str, value: &str) -> Result<(), StoreError> {
        self.update_multi(path, name, &mut |current: &mut Vec<String>| {
            if !current.iter().any(|v| v == value) {
                current.push(value.to_string());
            }
        })
    }

    /// Remove every occurrence of the given values.
    fn remove_multi(&self, path: &str, name: &str, values: &[String]) -> Result<(), StoreError> {
        self.update_multi(path, name, &mut |current: &mut Vec<String>| {
            current.retain(|v| !values.contains(v))
        })
    }
}

/// SQLite side-store.
pub struct SqliteSideStore {
    conn: Mutex<Connection>,
}

impl SqliteSideStore {
    /// Open or create a side-store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS side_store (
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (path, name)
            );
            "#,
        )?;

        debug!("Side-store schema initialized");
        Ok(())
    }
}

fn read_raw(conn: &Connection, path: &str, name: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM side_store WHERE path = ?1 AND name = ?2",
            params![path, name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn write_raw(conn: &Connection, path: &str, name: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO side_store (path, name, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(path, name) DO UPDATE SET value = excluded.value",
        params![path, name, value],
    )?;
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(
    raw: &str,
    path: &str,
    name: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Encoding {
        path: path.to_string(),
        name: name.to_string(),
        source,
    })
}

fn encode<T: serde::Serialize>(value: &T, path: &str, name: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encoding {
        path: path.to_string(),
        name: name.to_string(),
        source,
    })
}

impl SideStore for SqliteSideStore {
    fn get_multi(&self, path: &str, name: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        match read_raw(&conn, path, name)? {
            Some(raw) => decode(&raw, path, name),
            None => Ok(Vec::new()),
        }
    }

    fn update_multi(
        &self,
        path: &str,
        name: &str,
        update: &mut dyn FnMut(&mut Vec<String>),
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut values: Vec<String> = match read_raw(&tx, path, name)? {
            Some(raw) => decode(&raw, path, name)?,
            None => Vec::new(),
        };
        update(&mut values);
        write_raw(&tx, path, name, &encode(&values, path, name)?)?;

        tx.commit()?;
        debug!(path, name, count = values.len(), "Side-store value updated");
        Ok(())
    }

    fn get_string(&self, path: &str, name: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        match read_raw(&conn, path, name)? {
            Some(raw) => decode(&raw, path, name).map(Some),
            None => Ok(None),
        }
    }

    fn set_string(&self, path: &str, name: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        write_raw(&conn, path, name, &encode(&value, path, name)?)
    }
}
