//! Loading migrations and desired schemas from disk
//!
//! Migrations are TOML files named `<YYYYMMDDHHMMSS>_<name>.toml`, one
//! migration per file. The desired-schema file used by `migrate diff` is a
//! separate TOML document.

pub mod migration_file;
pub mod schema_file;

use crate::catalog::SchemaError;
use crate::migration::{Migration, MigrationError};
use std::path::PathBuf;
use thiserror::Error;

pub use migration_file::{MigrationFile, TomlLoader, scaffold, write_migration};
pub use schema_file::{SchemaFile, load_desired_schema};

/// The full, ordered set of local migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Sort by id and reject duplicates.
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self, LoadError> {
        migrations.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = migrations.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(LoadError::DuplicateId {
                id: pair[0].id.clone(),
            });
        }
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.position(id).map(|i| &self.migrations[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.migrations
            .binary_search_by(|m| m.id.as_str().cmp(id))
            .ok()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.migrations.iter().map(|m| m.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Trait for migration loaders. Each on-disk format implements this.
pub trait MigrationLoader {
    /// Load every migration found under the given paths.
    fn load(&self, paths: &[PathBuf]) -> Result<MigrationSet, LoadError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid migration {path}: {source}")]
    InvalidMigration {
        path: PathBuf,
        #[source]
        source: MigrationError,
    },

    #[error("Invalid schema in {path}: {source}")]
    InvalidSchema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },

    #[error("Duplicate migration id `{id}`")]
    DuplicateId { id: String },

    #[error("Refusing to overwrite existing file {path}")]
    Exists { path: PathBuf },

    #[error("Failed to serialize {path}: {message}")]
    Serialize { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty(id: &str) -> Migration {
        Migration::new(id, Vec::new()).unwrap()
    }

    #[test]
    fn test_migration_set_sorts_by_id() {
        let set = MigrationSet::new(vec![
            empty("20240301000000_C"),
            empty("20240101000000_A"),
            empty("20240201000000_B"),
        ])
        .unwrap();
        let ids: Vec<&str> = set.ids().collect();
        assert_eq!(
            ids,
            vec!["20240101000000_A", "20240201000000_B", "20240301000000_C"]
        );
        assert_eq!(set.position("20240201000000_B"), Some(1));
        assert!(set.get("20240401000000_D").is_none());
    }

    #[test]
    fn test_migration_set_rejects_duplicates() {
        let err = MigrationSet::new(vec![empty("20240101000000_A"), empty("20240101000000_A")])
            .unwrap_err();
        assert!(matches!(err, LoadError::DuplicateId { ref id } if id == "20240101000000_A"));
    }
}
