//! SQL dialects
//!
//! A [`Dialect`] renders one [`ChangeOperation`] into the DDL statements that
//! perform it. Rendering sees the catalog *before* the operation, which is how
//! SQLite knows the full shape of a table it has to rebuild.

pub mod postgres;
pub mod sqlite;

use crate::catalog::{Catalog, SchemaError};
use crate::operation::{ChangeOperation, ColumnDef, DefaultExpr, ForeignKeyDef, IndexDef, ReferentialAction};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Supported target databases.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[serde(alias = "postgresql")]
    #[strum(to_string = "postgres", serialize = "postgresql")]
    Postgres,
    #[default]
    #[strum(to_string = "sqlite")]
    Sqlite,
}

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::Postgres => &PostgresDialect,
            DialectKind::Sqlite => &SqliteDialect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("{dialect} cannot {operation}: {reason}")]
    Unsupported {
        dialect: DialectKind,
        operation: String,
        reason: String,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl RenderError {
    pub(crate) fn unsupported(dialect: DialectKind, op: &ChangeOperation, reason: impl Into<String>) -> Self {
        RenderError::Unsupported {
            dialect,
            operation: op.describe(),
            reason: reason.into(),
        }
    }
}

pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Render `op` against the schema as it is before `op` runs.
    ///
    /// An empty result means the operation needs no DDL on this dialect.
    fn render(&self, op: &ChangeOperation, catalog: &Catalog) -> Result<Vec<String>, RenderError>;

    /// Concrete type for a column, including length or precision.
    fn column_type(&self, column: &ColumnDef) -> String;

    fn bool_literal(&self, value: bool) -> &'static str;

    /// Column type used for timestamps in the bookkeeping tables.
    fn timestamp_type(&self) -> &'static str;

    /// A query returning one row when `table` exists.
    fn table_exists_sql(&self, table: &str) -> String;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn default_sql(&self, default: &DefaultExpr) -> String {
        match default {
            DefaultExpr::Text(text) => self.quote_literal(text),
            DefaultExpr::Bool(value) => self.bool_literal(*value).to_string(),
            DefaultExpr::Expression(expr) => expr.clone(),
        }
    }

    /// Comma-separated quoted identifiers.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn create_index_sql(&self, table: &str, index: &IndexDef) -> String {
        let mut sql = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_ident(&index.name),
            self.quote_ident(table),
            self.column_list(&index.columns),
        );
        if let Some(filter) = &index.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        sql
    }

    fn drop_index_sql(&self, index: &str) -> String {
        format!("DROP INDEX {}", self.quote_ident(index))
    }

    /// `CONSTRAINT "name" FOREIGN KEY (...) REFERENCES ...`, shared by table
    /// bodies and `ADD CONSTRAINT`.
    fn foreign_key_clause(&self, fk: &ForeignKeyDef) -> String {
        let mut sql = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote_ident(&fk.name),
            self.column_list(&fk.columns),
            self.quote_ident(&fk.ref_table),
            self.column_list(&fk.ref_columns),
        );
        if fk.on_delete != ReferentialAction::NoAction {
            sql.push_str(&format!(" ON DELETE {}", fk.on_delete));
        }
        if fk.on_update != ReferentialAction::NoAction {
            sql.push_str(&format!(" ON UPDATE {}", fk.on_update));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ColumnType;

    #[test]
    fn test_dialect_kind_parsing() {
        assert_eq!("postgres".parse::<DialectKind>().unwrap(), DialectKind::Postgres);
        assert_eq!("postgresql".parse::<DialectKind>().unwrap(), DialectKind::Postgres);
        assert_eq!("sqlite".parse::<DialectKind>().unwrap(), DialectKind::Sqlite);
        assert!("mysql".parse::<DialectKind>().is_err());
        assert_eq!(DialectKind::Postgres.to_string(), "postgres");
    }

    #[test]
    fn test_quoting_escapes_embedded_quotes() {
        let d = DialectKind::Postgres.dialect();
        assert_eq!(d.quote_ident("Odd\"Name"), "\"Odd\"\"Name\"");
        assert_eq!(d.quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_default_rendering_per_dialect() {
        let default = DefaultExpr::Bool(true);
        assert_eq!(DialectKind::Postgres.dialect().default_sql(&default), "TRUE");
        assert_eq!(DialectKind::Sqlite.dialect().default_sql(&default), "1");
        assert_eq!(
            DialectKind::Sqlite
                .dialect()
                .default_sql(&DefaultExpr::Expression("CURRENT_TIMESTAMP".to_string())),
            "CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn test_partial_unique_index() {
        let d = DialectKind::Sqlite.dialect();
        let index = IndexDef::new("IX_Parents_ApplicationUserId", &["ApplicationUserId"])
            .unique()
            .with_filter("\"ApplicationUserId\" IS NOT NULL");
        assert_eq!(
            d.create_index_sql("Parents", &index),
            "CREATE UNIQUE INDEX \"IX_Parents_ApplicationUserId\" ON \"Parents\" (\"ApplicationUserId\") WHERE \"ApplicationUserId\" IS NOT NULL"
        );
    }

    #[test]
    fn test_column_type_mapping_differs() {
        let col = ColumnDef::new("Name", ColumnType::String).with_max_length(100);
        assert_eq!(DialectKind::Postgres.dialect().column_type(&col), "varchar(100)");
        assert_eq!(DialectKind::Sqlite.dialect().column_type(&col), "TEXT");
    }
}
