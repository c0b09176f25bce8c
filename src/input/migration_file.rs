//! TOML migration files
//!
//! ```toml
//! description = "Add classes"
//! transaction = true
//!
//! [[up]]
//! op = "add_column"
//! table = "Parents"
//! column = { name = "ApplicationUserId", type = "string", max_length = 450 }
//! ```
//!
//! `[[down]]` is optional. Without it the down steps are derived from `[[up]]`.

use crate::input::{LoadError, MigrationLoader, MigrationSet};
use crate::migration::{self, Migration};
use crate::operation::ChangeOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk shape of one migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_transaction", skip_serializing_if = "is_true")]
    pub transaction: bool,

    #[serde(default)]
    pub up: Vec<ChangeOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<Vec<ChangeOperation>>,
}

fn default_transaction() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

impl MigrationFile {
    pub fn into_migration(self, id: &str, path: &Path) -> Result<Migration, LoadError> {
        let mut migration = Migration::from_parts(id, self.up, self.down)
            .map_err(|source| LoadError::InvalidMigration {
                path: path.to_path_buf(),
                source,
            })?
            .with_source_file(path);
        migration.run_in_transaction = self.transaction;
        migration.description = self.description;
        Ok(migration)
    }
}

/// Loader for `<id>.toml` migration files.
///
/// Each path can be a directory (all `.toml` files directly inside it are
/// loaded) or a single file. Files are ordered by name, which is id order.
#[derive(Debug, Default)]
pub struct TomlLoader;

impl TomlLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and parse a single migration file. The id is the file stem.
    pub fn load_file(&self, path: &Path) -> Result<Migration, LoadError> {
        let source = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let file: MigrationFile = toml::from_str(&source).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let migration = file.into_migration(&id, path)?;
        debug!(
            id = %migration.id,
            up = migration.up().len(),
            down = migration.down().len(),
            derived = migration.down_derived,
            "loaded migration"
        );
        Ok(migration)
    }
}

impl MigrationLoader for TomlLoader {
    fn load(&self, paths: &[PathBuf]) -> Result<MigrationSet, LoadError> {
        let mut files: Vec<PathBuf> = Vec::new();

        for path in paths {
            if path.is_dir() {
                files.extend(collect_toml_files(path)?);
            } else if path.is_file() {
                if is_toml_file(path) {
                    files.push(path.clone());
                }
            } else {
                return Err(LoadError::Io {
                    path: path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("Path does not exist: {}", path.display()),
                    ),
                });
            }
        }

        files.sort_by(|a, b| {
            let a_name = a.file_name().unwrap_or_default();
            let b_name = b.file_name().unwrap_or_default();
            a_name.cmp(b_name)
        });

        let migrations = files
            .iter()
            .map(|file| self.load_file(file))
            .collect::<Result<Vec<_>, _>>()?;
        MigrationSet::new(migrations)
    }
}

/// Collect all `.toml` files from a directory (non-recursive).
fn collect_toml_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|e| LoadError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LoadError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && is_toml_file(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

fn is_toml_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn create_new_file(dir: &Path, id: &str, content: &str) -> Result<PathBuf, LoadError> {
    std::fs::create_dir_all(dir).map_err(|e| LoadError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let path = dir.join(format!("{id}.toml"));
    if path.exists() {
        return Err(LoadError::Exists { path });
    }
    std::fs::write(&path, content).map_err(|e| LoadError::Io {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}

fn new_id_for(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<String, LoadError> {
    migration::new_id(name, now).map_err(|source| LoadError::InvalidMigration {
        path: dir.join(name),
        source,
    })
}

/// Create an empty migration file with a commented template.
pub fn scaffold(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf, LoadError> {
    let id = new_id_for(dir, name, now)?;
    let content = format!(
        r#"# Migration {id}
#
# description = "What this migration does"
# transaction = false   # run statement by statement, outside a transaction
#
# [[up]]
# op = "create_table"
# name = "Branches"
# columns = [
#     {{ name = "Id", type = "integer", identity = true }},
#     {{ name = "Name", type = "string", max_length = 100, nullable = false }},
# ]
# primary_key = {{ name = "PK_Branches", columns = ["Id"] }}
#
# [[up]]
# op = "add_index"
# table = "Branches"
# index = {{ name = "IX_Branches_Name", columns = ["Name"], unique = true }}
#
# Down steps are derived from [[up]]. Write [[down]] entries to override them.
"#
    );
    create_new_file(dir, &id, &content)
}

/// Write a new migration file holding `up`. Down steps are left to derivation.
pub fn write_migration(
    dir: &Path,
    name: &str,
    now: DateTime<Utc>,
    up: Vec<ChangeOperation>,
    description: Option<String>,
) -> Result<PathBuf, LoadError> {
    let id = new_id_for(dir, name, now)?;
    let file = MigrationFile {
        description,
        transaction: true,
        up,
        down: None,
    };
    let content = toml::to_string(&file).map_err(|e| LoadError::Serialize {
        path: dir.join(format!("{id}.toml")),
        message: e.to_string(),
    })?;
    create_new_file(dir, &id, &content)
}
