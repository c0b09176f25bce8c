//! Desired-schema files for `migrate diff`.
//!
//! ```toml
//! [[tables]]
//! name = "Curriculum"
//! renamed_from = "Curricula"
//! primary_key = { name = "PK_Curriculum", columns = ["Id"] }
//!
//! [[tables.columns]]
//! name = "Id"
//! type = "integer"
//! identity = true
//! ```

use crate::catalog::{self, Catalog, SchemaError};
use crate::diff::RenameHints;
use crate::input::LoadError;
use crate::operation::{
    ChangeOperation, ColumnDef, ColumnType, DefaultExpr, ForeignKeyDef, IndexDef, PrimaryKeyDef,
    TableDef,
};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaFile {
    #[serde(default)]
    pub tables: Vec<DesiredTable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredTable {
    pub name: String,
    #[serde(default)]
    pub renamed_from: Option<String>,
    pub columns: Vec<DesiredColumn>,
    #[serde(default)]
    pub primary_key: Option<PrimaryKeyDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

/// A column plus an optional rename hint. Same keys as a migration's column.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<DefaultExpr>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub scale: Option<u8>,
    #[serde(default)]
    pub identity: bool,
    #[serde(default)]
    pub renamed_from: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl DesiredColumn {
    pub fn to_column(&self) -> ColumnDef {
        ColumnDef {
            name: self.name.clone(),
            column_type: self.column_type,
            nullable: self.nullable,
            default: self.default.clone(),
            max_length: self.max_length,
            precision: self.precision,
            scale: self.scale,
            identity: self.identity,
        }
    }
}

impl SchemaFile {
    pub fn parse(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Rename hints keyed by the desired (new) names.
    pub fn rename_hints(&self) -> RenameHints {
        let mut hints = RenameHints::default();
        for table in &self.tables {
            if let Some(old) = &table.renamed_from {
                hints = hints.table(old, &table.name);
            }
            for column in &table.columns {
                if let Some(old) = &column.renamed_from {
                    hints = hints.column(&table.name, old, &column.name);
                }
            }
        }
        hints
    }

    /// Build the desired catalog with the same strict checks as migration replay.
    ///
    /// Tables are created without foreign keys first, so references may point
    /// at tables declared later in the file.
    pub fn to_catalog(&self) -> Result<Catalog, SchemaError> {
        let mut catalog = Catalog::new();
        for table in &self.tables {
            let def = TableDef {
                name: table.name.clone(),
                columns: table.columns.iter().map(DesiredColumn::to_column).collect(),
                primary_key: table.primary_key.clone(),
                foreign_keys: Vec::new(),
                indexes: table.indexes.clone(),
            };
            catalog::apply(&mut catalog, &ChangeOperation::CreateTable(def))?;
        }
        for table in &self.tables {
            for foreign_key in &table.foreign_keys {
                catalog::apply(
                    &mut catalog,
                    &ChangeOperation::AddForeignKey {
                        table: table.name.clone(),
                        foreign_key: foreign_key.clone(),
                    },
                )?;
            }
        }
        Ok(catalog)
    }
}

/// Read a desired-schema file into a catalog and its rename hints.
pub fn load_desired_schema(path: &Path) -> Result<(Catalog, RenameHints), LoadError> {
    let source = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let file = SchemaFile::parse(&source).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let catalog = file.to_catalog().map_err(|source| LoadError::InvalidSchema {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((catalog, file.rename_hints()))
}
