//! Database connections.
//!
//! The runner talks to the target database only through [`Database`]: plain
//! statements in, string-typed rows out. Transactions are explicit statements
//! so a migration that opts out of a transaction simply never issues `BEGIN`.

pub mod sqlite;

use crate::dialect::Dialect;
use thiserror::Error;

pub use sqlite::SqliteDatabase;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

/// One row of a query result. Every value is rendered as text; SQL NULL is `None`.
pub type Row = Vec<Option<String>>;

pub trait Database {
    fn dialect(&self) -> &'static dyn Dialect;

    /// Execute one or more statements. Returns the number of rows changed by
    /// the last statement.
    fn execute(&mut self, sql: &str) -> Result<usize, DbError>;

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError>;

    fn begin(&mut self) -> Result<(), DbError> {
        self.execute("BEGIN").map(|_| ())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT").map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK").map(|_| ())
    }
}
