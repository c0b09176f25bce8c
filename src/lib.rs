//! schema-migrate: reversible, checksummed schema migrations
//!
//! Migrations are ordered lists of [`ChangeOperation`]s. The runner replays
//! them into an in-memory [`Catalog`], renders each operation for the target
//! dialect, and applies pending ones under an advisory lock while recording
//! every step in a history ledger. [`diff`] plans the operations that turn
//! one catalog into another.

pub mod catalog;
pub mod config;
pub mod dialect;
pub mod diff;
pub mod driver;
pub mod history;
pub mod input;
pub mod lock;
pub mod logging;
pub mod migration;
pub mod operation;
pub mod output;
pub mod runner;

// Re-export commonly used types
pub use catalog::{Catalog, SchemaError};
pub use config::Config;
pub use dialect::{Dialect, DialectKind};
pub use diff::{RenameHints, diff, diff_with_renames};
pub use driver::{Database, SqliteDatabase};
pub use history::MigrationHistory;
pub use input::{MigrationLoader, MigrationSet, TomlLoader};
pub use migration::Migration;
pub use operation::ChangeOperation;
pub use runner::{DownTarget, MigrationRunner, RunReport, StatusReport};
