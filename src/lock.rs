//! Cross-process advisory lock, held as a single row in a lock table.
//!
//! The row's primary key is fixed at 1, so a second insert fails while the
//! lock is held. The row is deleted on release; a crashed runner leaves it
//! behind until `migrate unlock` clears it.

use crate::dialect::Dialect;
use crate::driver::{Database, DbError};
use chrono::{SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TABLE: &str = "__migration_lock";

/// Distinguishes locks created by the same process.
static NEXT_LOCK: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("migration lock is held by {holder}; if that process is gone, run `migrate unlock`")]
    Held { holder: String },

    #[error(transparent)]
    Database(#[from] DbError),
}

#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    holder: String,
}

impl MigrationLock {
    pub fn new(table: impl Into<String>) -> Self {
        let holder = format!(
            "pid {} #{} since {}",
            std::process::id(),
            NEXT_LOCK.fetch_add(1, Ordering::Relaxed),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        Self {
            table: table.into(),
            holder,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn create_table_sql(&self, dialect: &dyn Dialect) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {} INTEGER PRIMARY KEY CHECK ({} = 1),\n    {} TEXT NOT NULL\n)",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_ident("id"),
            dialect.quote_ident("holder"),
        )
    }

    fn current_holder(&self, db: &mut dyn Database) -> Result<Option<String>, DbError> {
        let dialect = db.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = 1",
            dialect.quote_ident("holder"),
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
        );
        Ok(db
            .query(&sql)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten()))
    }

    pub fn acquire(&self, db: &mut dyn Database) -> Result<(), LockError> {
        let dialect = db.dialect();
        db.execute(&self.create_table_sql(dialect))?;

        let insert = format!(
            "INSERT INTO {} ({}, {}) VALUES (1, {})",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_ident("holder"),
            dialect.quote_literal(&self.holder),
        );
        match db.execute(&insert) {
            Ok(_) => {
                debug!(holder = %self.holder, "acquired migration lock");
                Ok(())
            }
            Err(err) => match self.current_holder(db)? {
                Some(holder) => Err(LockError::Held { holder }),
                None => Err(err.into()),
            },
        }
    }

    pub fn release(&self, db: &mut dyn Database) -> Result<(), DbError> {
        let dialect = db.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} = 1 AND {} = {}",
            dialect.quote_ident(&self.table),
            dialect.quote_ident("id"),
            dialect.quote_ident("holder"),
            dialect.quote_literal(&self.holder),
        );
        if db.execute(&sql)? == 0 {
            warn!(holder = %self.holder, "migration lock was already released");
        } else {
            debug!(holder = %self.holder, "released migration lock");
        }
        Ok(())
    }

    /// Remove the lock row whoever holds it. Returns the previous holder.
    pub fn force_release(&self, db: &mut dyn Database) -> Result<Option<String>, DbError> {
        let dialect = db.dialect();
        let exists = dialect.table_exists_sql(&self.table);
        if db.query(&exists)?.is_empty() {
            return Ok(None);
        }
        let previous = self.current_holder(db)?;
        db.execute(&format!("DELETE FROM {}", dialect.quote_ident(&self.table)))?;
        if let Some(holder) = &previous {
            warn!(%holder, "force-released migration lock");
        }
        Ok(previous)
    }
}
