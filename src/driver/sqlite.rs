use super::{Database, DbError, Row};
use crate::dialect::{Dialect, SqliteDialect};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// A SQLite database reached through rusqlite.
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self, DbError> {
        info!("opening sqlite database at {}", db_path.display());
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection. Foreign key enforcement is switched off:
    /// table rebuilds drop and recreate tables that other tables reference.
    pub fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

impl Database for SqliteDatabase {
    fn dialect(&self) -> &'static dyn Dialect {
        &SqliteDialect
    }

    fn execute(&mut self, sql: &str) -> Result<usize, DbError> {
        debug!(sql, "execute");
        self.conn.execute_batch(sql)?;
        Ok(self.conn.changes() as usize)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        debug!(sql, "query");
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(value_to_string(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_and_query_round_values_to_text() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (a INTEGER, b TEXT, c REAL)").unwrap();
        let changed = db
            .execute("INSERT INTO t VALUES (1, 'x', 1.5), (2, NULL, NULL)")
            .unwrap();
        assert_eq!(changed, 2);

        let rows = db.query("SELECT a, b, c FROM t ORDER BY a").unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("x".to_string()), Some("1.5".to_string())],
                vec![Some("2".to_string()), None, None],
            ]
        );
    }

    #[test]
    fn test_rollback_discards_changes() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (a INTEGER)").unwrap();
        db.begin().unwrap();
        db.execute("INSERT INTO t VALUES (1)").unwrap();
        db.rollback().unwrap();
        assert!(db.query("SELECT a FROM t").unwrap().is_empty());
    }

    #[test]
    fn test_foreign_keys_are_not_enforced() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let enabled: i64 = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 0);
    }

    #[test]
    fn test_errors_surface_as_db_error() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let err = db.execute("SELEC nonsense").unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));
    }
}
