// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Transactional SQLite store.
//!
//! One serialized connection per database file. Callers either use the
//! generic statement interface or take the connection for a transaction that
//! commits atomically (batch admission relies on this).

use rusqlite::{Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Store errors. Corruption is fatal to the node; everything else surfaces as
/// unavailability.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db open")]
    Open,
    #[error("db io")]
    Io,
    #[error("db corrupt")]
    Corrupt,
}

/// Schema version written into fresh databases.
const SCHEMA_VERSION: u64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS MyInfo (
    entry TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS community (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master BLOB UNIQUE NOT NULL,
    member INTEGER,
    global_time INTEGER NOT NULL DEFAULT 0,
    degree TEXT
);
CREATE TABLE IF NOT EXISTS member (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mid BLOB NOT NULL,
    public_key BLOB UNIQUE NOT NULL
);
CREATE INDEX IF NOT EXISTS member_mid ON member (mid);
CREATE TABLE IF NOT EXISTS meta_message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    community INTEGER NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (community, name)
);
CREATE TABLE IF NOT EXISTS sync (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    community INTEGER NOT NULL,
    member INTEGER NOT NULL,
    meta_message INTEGER NOT NULL,
    global_time INTEGER NOT NULL,
    packet BLOB NOT NULL,
    undone INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS sync_meta_global ON sync (community, meta_message, global_time);
CREATE INDEX IF NOT EXISTS sync_member_meta_global ON sync (community, member, meta_message, global_time);
CREATE TABLE IF NOT EXISTS double_signed_sync (
    sync INTEGER PRIMARY KEY,
    member1 INTEGER NOT NULL,
    member2 INTEGER NOT NULL
);
";

/// Serialized SQLite database handle.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|_| StoreError::Open)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|_| StoreError::Open)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(|_| StoreError::Open)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        if db.version()? == 0 {
            db.set_version(SCHEMA_VERSION)?;
        }
        Ok(db)
    }

    /// Run read/write statements on the connection under the lock.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Io)?;
        f(&guard)
    }

    /// Run statements inside one transaction; rolled back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Io)?;
        let tx = guard.transaction().map_err(|_| StoreError::Io)?;
        let out = f(&tx)?;
        tx.commit().map_err(|_| StoreError::Io)?;
        Ok(out)
    }

    /// Execute a statement; returns the affected row count.
    pub fn execute(&self, sql: &str, args: &[&dyn ToSql]) -> Result<usize, StoreError> {
        self.with_conn(|c| c.execute(sql, args).map_err(|_| StoreError::Io))
    }

    /// Execute a statement and return the last inserted row id.
    pub fn execute_lastrowid(&self, sql: &str, args: &[&dyn ToSql]) -> Result<i64, StoreError> {
        self.with_conn(|c| {
            c.execute(sql, args).map_err(|_| StoreError::Io)?;
            Ok(c.last_insert_rowid())
        })
    }

    /// Execute several statements sequentially.
    pub fn executescript(&self, statements: &str) -> Result<(), StoreError> {
        self.with_conn(|c| c.execute_batch(statements).map_err(|_| StoreError::Io))
    }

    /// Fetch the first matching row, mapped.
    pub fn fetchone<T>(
        &self,
        sql: &str,
        args: &[&dyn ToSql],
        map: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StoreError> {
        self.with_conn(|c| {
            c.query_row(sql, args, map)
                .optional()
                .map_err(|_| StoreError::Io)
        })
    }

    /// Fetch every matching row, mapped.
    pub fn fetchall<T>(
        &self,
        sql: &str,
        args: &[&dyn ToSql],
        map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(sql).map_err(|_| StoreError::Io)?;
            let rows = stmt.query_map(args, map).map_err(|_| StoreError::Io)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|_| StoreError::Io)?);
            }
            Ok(out)
        })
    }

    /// Insert a row given (column, value) pairs; returns the row id.
    pub fn insert(&self, table: &str, cols: &[(&str, &dyn ToSql)]) -> Result<i64, StoreError> {
        let names: Vec<&str> = cols.iter().map(|(n, _)| *n).collect();
        let marks = vec!["?"; cols.len()].join(",");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(","),
            marks
        );
        let args: Vec<&dyn ToSql> = cols.iter().map(|(_, v)| *v).collect();
        self.execute_lastrowid(&sql, &args)
    }

    /// Insert many rows sharing one column set, in a single transaction.
    pub fn insert_many(
        &self,
        table: &str,
        cols: &[&str],
        rows: &[Vec<&dyn ToSql>],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let marks = vec!["?"; cols.len()].join(",");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", table, cols.join(","), marks);
        self.with_tx(|c| {
            let mut stmt = c.prepare(&sql).map_err(|_| StoreError::Io)?;
            for row in rows {
                stmt.execute(row.as_slice()).map_err(|_| StoreError::Io)?;
            }
            Ok(())
        })
    }

    /// Delete rows matching every (column, value) pair; returns the count.
    pub fn delete(&self, table: &str, wheres: &[(&str, &dyn ToSql)]) -> Result<usize, StoreError> {
        let clause = wheres
            .iter()
            .map(|(n, _)| format!("{}=?", n))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("DELETE FROM {} WHERE {}", table, clause);
        let args: Vec<&dyn ToSql> = wheres.iter().map(|(_, v)| *v).collect();
        self.execute(&sql, &args)
    }

    /// Row count of a table.
    pub fn count(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT count(*) FROM {}", table);
        let n = self
            .fetchone(&sql, &[], |row| row.get::<_, i64>(0))?
            .unwrap_or(0);
        Ok(n.max(0) as u64)
    }

    /// Schema version from the `MyInfo` cell; a missing cell reads as 0.
    pub fn version(&self) -> Result<u64, StoreError> {
        let v = self.fetchone(
            "SELECT value FROM MyInfo WHERE entry = 'version'",
            &[],
            |row| row.get::<_, String>(0),
        )?;
        Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    /// Write the schema version cell.
    pub fn set_version(&self, version: u64) -> Result<(), StoreError> {
        self.execute(
            "INSERT OR REPLACE INTO MyInfo (entry, value) VALUES ('version', ?)",
            &[&version.to_string()],
        )?;
        Ok(())
    }
}
