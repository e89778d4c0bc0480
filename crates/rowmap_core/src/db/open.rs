//! SQLite storage: connection bootstrap and statement execution.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections from a DSN.
//! - Configure connection pragmas required by core behavior.
//! - Execute statements and introspect table columns.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` and a busy timeout.
//! - Lock hints are logged and otherwise ignored: SQLite has no row locks.

use super::storage::{ColumnInfo, RowSet, Statement, Storage};
use super::{DbError, DbResult};
use crate::config::StoreConfig;
use crate::model::Value;
use log::{debug, error, info};
use rusqlite::{params_from_iter, Connection};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Memory,
    File(PathBuf),
}

/// `Storage` implementation over one `rusqlite::Connection`.
pub struct SqliteStorage {
    conn: Connection,
    dsn: String,
}

impl SqliteStorage {
    /// Connects using default bootstrap options.
    ///
    /// Accepts `:memory:`, `sqlite::memory:`, `sqlite:<path>`,
    /// `sqlite://<path>` or a bare file path.
    pub fn connect(dsn: &str) -> DbResult<Self> {
        Self::connect_with_timeout(dsn, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Connects using the DSN and busy timeout from `config`.
    pub fn open(config: &StoreConfig) -> DbResult<Self> {
        Self::connect_with_timeout(
            &config.dsn,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Self::connect(":memory:")
    }

    fn connect_with_timeout(dsn: &str, busy_timeout: Duration) -> DbResult<Self> {
        let started_at = Instant::now();
        let target = parse_dsn(dsn)?;
        let mode = match target {
            Target::Memory => "memory",
            Target::File(_) => "file",
        };
        info!("event=db_open module=db status=start mode={mode}");

        let conn = match open_connection(&target, busy_timeout) {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(DbError::Connection {
                    dsn: dsn.to_string(),
                    source: err,
                });
            }
        };

        info!(
            "event=db_open module=db status=ok mode={mode} duration_ms={}",
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            conn,
            dsn: dsn.to_string(),
        })
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Underlying connection, for callers that need direct SQLite access.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Storage for SqliteStorage {
    fn execute(&mut self, statement: &Statement) -> DbResult<RowSet> {
        if let Some(lock) = statement.lock {
            debug!(
                "event=lock_hint module=db status=passthrough strength={}",
                lock.label()
            );
        }

        let mut stmt = self.conn.prepare_cached(&statement.sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        if columns.is_empty() {
            let rows_affected = stmt.execute(params_from_iter(statement.params.iter()))?;
            return Ok(RowSet {
                columns,
                rows: Vec::new(),
                rows_affected,
                last_insert_id: Some(self.conn.last_insert_rowid()),
            });
        }

        let readonly = stmt.readonly();
        let width = columns.len();
        let mut collected = Vec::new();
        let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(row.get::<_, Value>(index)?);
            }
            collected.push(values);
        }
        drop(rows);

        let (rows_affected, last_insert_id) = if readonly {
            (0, None)
        } else {
            (
                self.conn.changes() as usize,
                Some(self.conn.last_insert_rowid()),
            )
        };

        Ok(RowSet {
            columns,
            rows: collected,
            rows_affected,
            last_insert_id,
        })
    }

    fn begin_transaction(&mut self) -> DbResult<()> {
        if self.in_transaction() {
            return Err(DbError::TransactionState("transaction already active"));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        if !self.in_transaction() {
            return Err(DbError::TransactionState("no active transaction to commit"));
        }
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        if !self.in_transaction() {
            return Err(DbError::TransactionState(
                "no active transaction to roll back",
            ));
        }
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn list_columns(&mut self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, type, \"notnull\", pk
             FROM pragma_table_info(?1)
             ORDER BY cid ASC;",
        )?;
        let mut rows = stmt.query([table])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            columns.push(ColumnInfo {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                primary_key: row.get::<_, i64>(3)? != 0,
            });
        }
        Ok(columns)
    }

    fn list_indexes(&mut self, table: &str) -> DbResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM pragma_index_list(?1) ORDER BY seq ASC;")?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

fn open_connection(target: &Target, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = match target {
        Target::Memory => Connection::open_in_memory()?,
        Target::File(path) => Connection::open(path)?,
    };
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn parse_dsn(dsn: &str) -> DbResult<Target> {
    let trimmed = dsn.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);

    match path {
        "" => Err(DbError::InvalidDsn(dsn.to_string())),
        ":memory:" => Ok(Target::Memory),
        path => Ok(Target::File(PathBuf::from(path))),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_dsn, Target};
    use crate::db::DbError;
    use std::path::PathBuf;

    #[test]
    fn parse_dsn_accepts_memory_forms() {
        assert_eq!(parse_dsn(":memory:").unwrap(), Target::Memory);
        assert_eq!(parse_dsn("sqlite::memory:").unwrap(), Target::Memory);
        assert_eq!(parse_dsn("sqlite://:memory:").unwrap(), Target::Memory);
    }

    #[test]
    fn parse_dsn_accepts_file_forms() {
        assert_eq!(
            parse_dsn("sqlite:data/test.db").unwrap(),
            Target::File(PathBuf::from("data/test.db"))
        );
        assert_eq!(
            parse_dsn("sqlite:///tmp/test.db").unwrap(),
            Target::File(PathBuf::from("/tmp/test.db"))
        );
        assert_eq!(
            parse_dsn("test.db").unwrap(),
            Target::File(PathBuf::from("test.db"))
        );
    }

    #[test]
    fn parse_dsn_rejects_empty() {
        assert!(matches!(parse_dsn("  "), Err(DbError::InvalidDsn(_))));
        assert!(matches!(parse_dsn("sqlite:"), Err(DbError::InvalidDsn(_))));
    }
}
