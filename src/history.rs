//! The migration ledger: one row per applied migration.
//!
//! Writes go through the same connection as the migration's DDL, so inside a
//! transaction they commit or roll back together with it.

use crate::dialect::Dialect;
use crate::driver::{Database, DbError, Row};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info};

pub const DEFAULT_HISTORY_TABLE: &str = "__migration_history";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: String,
    pub applied_at: String,
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct MigrationHistory {
    table: String,
}

impl Default for MigrationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TABLE)
    }
}

impl MigrationHistory {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn create_table_sql(&self, dialect: &dyn Dialect) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {} TEXT PRIMARY KEY,\n    {} {} NOT NULL,\n    {} TEXT NOT NULL\n)",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_ident("applied_at"),
            dialect.timestamp_type(),
            dialect.quote_ident("checksum"),
        )
    }

    /// Ledger insert. Without `applied_at` the database clock is used.
    pub fn insert_sql(
        &self,
        dialect: &dyn Dialect,
        id: &str,
        checksum: &str,
        applied_at: Option<DateTime<Utc>>,
    ) -> String {
        let applied_at = match applied_at {
            Some(at) => dialect.quote_literal(&at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => "CURRENT_TIMESTAMP".to_string(),
        };
        format!(
            "INSERT INTO {} ({}, {}, {}) VALUES ({}, {}, {})",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_ident("applied_at"),
            dialect.quote_ident("checksum"),
            dialect.quote_literal(id),
            applied_at,
            dialect.quote_literal(checksum),
        )
    }

    pub fn delete_sql(&self, dialect: &dyn Dialect, id: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_literal(id),
        )
    }

    pub fn exists(&self, db: &mut dyn Database) -> Result<bool, DbError> {
        let sql = db.dialect().table_exists_sql(&self.table);
        Ok(!db.query(&sql)?.is_empty())
    }

    /// Create the ledger if it is missing. Returns true when it was created.
    pub fn ensure_table(&self, db: &mut dyn Database) -> Result<bool, DbError> {
        if self.exists(db)? {
            return Ok(false);
        }
        let sql = self.create_table_sql(db.dialect());
        db.execute(&sql)?;
        info!(table = %self.table, "created migration history table");
        Ok(true)
    }

    /// Applied migrations ordered by id. Empty when the ledger does not exist yet.
    pub fn list_applied(&self, db: &mut dyn Database) -> Result<Vec<AppliedMigration>, DbError> {
        if !self.exists(db)? {
            return Ok(Vec::new());
        }
        let dialect = db.dialect();
        let sql = format!(
            "SELECT {}, CAST({} AS TEXT), {} FROM {} ORDER BY {}",
            dialect.quote_ident("id"),
            dialect.quote_ident("applied_at"),
            dialect.quote_ident("checksum"),
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
        );
        db.query(&sql)?.into_iter().map(|row| self.parse_row(row)).collect()
    }

    fn parse_row(&self, row: Row) -> Result<AppliedMigration, DbError> {
        let mut values = row.into_iter();
        let mut next = |column: &str| {
            values.next().flatten().ok_or_else(|| {
                DbError::Other(format!("`{}` has a row without {column}", self.table))
            })
        };
        Ok(AppliedMigration {
            id: next("id")?,
            applied_at: next("applied_at")?,
            checksum: next("checksum")?,
        })
    }

    pub fn record_applied(
        &self,
        db: &mut dyn Database,
        id: &str,
        checksum: &str,
    ) -> Result<(), DbError> {
        let sql = self.insert_sql(db.dialect(), id, checksum, Some(Utc::now()));
        db.execute(&sql)?;
        debug!(id, "recorded applied migration");
        Ok(())
    }

    pub fn record_reverted(&self, db: &mut dyn Database, id: &str) -> Result<(), DbError> {
        let sql = self.delete_sql(db.dialect(), id);
        let removed = db.execute(&sql)?;
        if removed != 1 {
            return Err(DbError::Other(format!(
                "expected to remove one `{}` row for `{id}`, removed {removed}",
                self.table
            )));
        }
        debug!(id, "recorded reverted migration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDatabase;

    #[test]
    fn test_ensure_table_is_idempotent() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let history = MigrationHistory::default();

        assert!(!history.exists(&mut db).unwrap());
        assert!(history.ensure_table(&mut db).unwrap());
        assert!(!history.ensure_table(&mut db).unwrap());
        assert!(history.exists(&mut db).unwrap());
    }

    #[test]
    fn test_list_applied_without_table_is_empty() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let history = MigrationHistory::default();
        assert!(history.list_applied(&mut db).unwrap().is_empty());
        assert!(!history.exists(&mut db).unwrap(), "listing must not create the ledger");
    }

    #[test]
    fn test_record_and_revert_keep_id_order() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let history = MigrationHistory::new("ledger");
        history.ensure_table(&mut db).unwrap();

        history
            .record_applied(&mut db, "20240102000000_B", "bbb")
            .unwrap();
        history
            .record_applied(&mut db, "20240101000000_A", "aaa")
            .unwrap();

        let applied = history.list_applied(&mut db).unwrap();
        let ids: Vec<&str> = applied.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["20240101000000_A", "20240102000000_B"]);
        assert_eq!(applied[0].checksum, "aaa");
        assert!(applied[0].applied_at.ends_with('Z'));

        history.record_reverted(&mut db, "20240102000000_B").unwrap();
        assert_eq!(history.list_applied(&mut db).unwrap().len(), 1);

        let err = history
            .record_reverted(&mut db, "20240102000000_B")
            .unwrap_err();
        assert!(matches!(err, DbError::Other(_)));
    }

    #[test]
    fn test_offline_insert_uses_database_clock() {
        let history = MigrationHistory::default();
        let sql = history.insert_sql(
            crate::dialect::DialectKind::Postgres.dialect(),
            "20240101000000_A",
            "abc",
            None,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"__migration_history\" (\"id\", \"applied_at\", \"checksum\") VALUES ('20240101000000_A', CURRENT_TIMESTAMP, 'abc')"
        );
    }
}
