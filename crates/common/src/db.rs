//! SQLite-backed keyed store for wgmesh state persistence
//!
//! Every record is a JSON document under `(table, key)`. Single-key writes are
//! serialized by the connection lock; multi-key mutations go through [`Database::batch`]
//! so they commit or roll back together.

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Logical table names
pub mod tables {
    pub const HOSTS: &str = "hosts";
    pub const NODES: &str = "nodes";
    pub const NETWORKS: &str = "networks";
    pub const EXT_CLIENTS: &str = "extclients";
    pub const ENROLLMENT_KEYS: &str = "enrollment_keys";
    pub const DNS: &str = "dns";
    pub const USERS: &str = "users";
    pub const USER_GROUPS: &str = "user_groups";
    pub const NETWORK_USERS: &str = "networkusers";
    pub const SERVER_CONFIG: &str = "server_config";
    pub const CACHE: &str = "cache";
    pub const ACLS: &str = "acls";
}

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(10))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tbl, key)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Single-key operations
    // ========================================================================

    /// Fetch and decode one record
    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock();
        fetch(&conn, table, key)
    }

    /// All records of a table, ordered by key
    pub fn list<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        fetch_all(&conn, table, None)
    }

    /// Records whose key starts with `prefix` (composite `<net>.<id>` keys)
    pub fn list_prefix<T: DeserializeOwned>(&self, table: &str, prefix: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        fetch_all(&conn, table, Some(prefix))
    }

    /// Insert a record that must not already exist
    pub fn create<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        let conn = self.conn.lock();
        insert_new(&conn, table, key, value)
    }

    /// Insert or overwrite a record
    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        let conn = self.conn.lock();
        store(&conn, table, key, value)
    }

    /// Atomic read-modify-write of one record
    pub fn update<T, F>(&self, table: &str, key: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<()>,
    {
        self.batch(|batch| {
            let mut value: T = batch
                .get(table, key)?
                .ok_or_else(|| Error::not_found(table, key))?;
            f(&mut value)?;
            batch.put(table, key, &value)?;
            Ok(value)
        })
    }

    /// Delete a record, returning whether it existed
    pub fn delete(&self, table: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        remove(&conn, table, key)
    }

    /// Check if a record exists
    pub fn exists(&self, table: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE tbl = ?1 AND key = ?2",
            params![table, key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Stored version of a record (bumped on every write)
    pub fn version(&self, table: &str, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let version = conn
            .query_row(
                "SELECT version FROM records WHERE tbl = ?1 AND key = ?2",
                params![table, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `f` inside one transaction. Nothing is written unless `f` returns `Ok`.
    pub fn batch<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Batch<'_>) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let batch = Batch { tx };
        let out = f(&batch)?;
        batch.tx.commit()?;
        Ok(out)
    }
}

/// Handle to an open transaction
pub struct Batch<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Batch<'_> {
    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        fetch(&self.tx, table, key)
    }

    pub fn list<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        fetch_all(&self.tx, table, None)
    }

    pub fn list_prefix<T: DeserializeOwned>(&self, table: &str, prefix: &str) -> Result<Vec<T>> {
        fetch_all(&self.tx, table, Some(prefix))
    }

    pub fn create<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        insert_new(&self.tx, table, key, value)
    }

    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        store(&self.tx, table, key, value)
    }

    pub fn delete(&self, table: &str, key: &str) -> Result<bool> {
        remove(&self.tx, table, key)
    }
}

fn fetch<T: DeserializeOwned>(conn: &Connection, table: &str, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM records WHERE tbl = ?1 AND key = ?2",
            params![table, key],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn fetch_all<T: DeserializeOwned>(
    conn: &Connection,
    table: &str,
    prefix: Option<&str>,
) -> Result<Vec<T>> {
    let prefix = prefix.unwrap_or("");
    let mut stmt = conn.prepare(
        "SELECT value FROM records WHERE tbl = ?1 AND substr(key, 1, length(?2)) = ?2 ORDER BY key",
    )?;

    let rows = stmt.query_map(params![table, prefix], |row| row.get::<_, String>(0))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(serde_json::from_str(&row?)?);
    }

    Ok(results)
}

fn insert_new<T: Serialize>(conn: &Connection, table: &str, key: &str, value: &T) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let rows = conn.execute(
        "INSERT OR IGNORE INTO records (tbl, key, value, version, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![table, key, serde_json::to_string(value)?, now],
    )?;

    if rows == 0 {
        return Err(Error::already_exists(table, key));
    }

    debug!("Inserted {} with key {}", table, key);
    Ok(())
}

fn store<T: Serialize>(conn: &Connection, table: &str, key: &str, value: &T) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO records (tbl, key, value, version, updated_at) VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(tbl, key) DO UPDATE SET
            value = excluded.value,
            version = records.version + 1,
            updated_at = excluded.updated_at",
        params![table, key, serde_json::to_string(value)?, now],
    )?;

    debug!("Stored {} with key {}", table, key);
    Ok(())
}

fn remove(conn: &Connection, table: &str, key: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM records WHERE tbl = ?1 AND key = ?2",
        params![table, key],
    )?;

    if rows > 0 {
        debug!("Deleted {} with key {}", table, key);
    }

    Ok(rows > 0)
}
