//! PostgreSQL rendering. Every operation has native DDL.

use super::{Dialect, DialectKind, RenderError};
use crate::catalog::Catalog;
use crate::operation::{ChangeOperation, ColumnDef, ColumnType, TableDef};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn column_sql(&self, column: &ColumnDef) -> String {
        let mut sql = format!("{} {}", self.quote_ident(&column.name), self.column_type(column));
        if column.identity {
            // Identity columns are implicitly NOT NULL and have no default.
            sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            return sql;
        }
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&self.default_sql(default));
        }
        sql
    }

    fn create_table_sql(&self, def: &TableDef) -> Vec<String> {
        let mut lines: Vec<String> = def.columns.iter().map(|c| self.column_sql(c)).collect();
        if let Some(pk) = &def.primary_key {
            lines.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&pk.name),
                self.column_list(&pk.columns)
            ));
        }
        for fk in &def.foreign_keys {
            lines.push(self.foreign_key_clause(fk));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.quote_ident(&def.name),
            lines.join(",\n    ")
        )];
        statements.extend(
            def.indexes
                .iter()
                .map(|idx| self.create_index_sql(&def.name, idx)),
        );
        statements
    }

    fn alter_column_sql(&self, table: &str, from: &ColumnDef, to: &ColumnDef) -> Vec<String> {
        let column = self.quote_ident(&to.name);
        let mut actions = Vec::new();

        let to_type = self.column_type(to);
        if self.column_type(from) != to_type {
            actions.push(format!(
                "ALTER COLUMN {column} TYPE {to_type} USING {column}::{to_type}"
            ));
        }
        if from.identity && !to.identity {
            actions.push(format!("ALTER COLUMN {column} DROP IDENTITY"));
        }
        // Identity columns are NOT NULL, and the constraint has to exist
        // before ADD ... IDENTITY.
        let from_nullable = from.nullable && !from.identity;
        let to_nullable = to.nullable && !to.identity;
        if from_nullable != to_nullable {
            let verb = if to_nullable { "DROP" } else { "SET" };
            actions.push(format!("ALTER COLUMN {column} {verb} NOT NULL"));
        }
        if from.default != to.default {
            match &to.default {
                Some(default) => actions.push(format!(
                    "ALTER COLUMN {column} SET DEFAULT {}",
                    self.default_sql(default)
                )),
                None => actions.push(format!("ALTER COLUMN {column} DROP DEFAULT")),
            }
        }
        if to.identity && !from.identity {
            actions.push(format!(
                "ALTER COLUMN {column} ADD GENERATED BY DEFAULT AS IDENTITY"
            ));
        }

        if actions.is_empty() {
            return Vec::new();
        }
        vec![format!(
            "ALTER TABLE {} {}",
            self.quote_ident(table),
            actions.join(", ")
        )]
    }
}

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn render(&self, op: &ChangeOperation, _catalog: &Catalog) -> Result<Vec<String>, RenderError> {
        let q = |ident: &str| self.quote_ident(ident);
        let statements = match op {
            ChangeOperation::CreateTable(def) => self.create_table_sql(def),
            ChangeOperation::DropTable(def) => vec![format!("DROP TABLE {}", q(&def.name))],
            ChangeOperation::RenameTable { name, new_name } => {
                vec![format!("ALTER TABLE {} RENAME TO {}", q(name), q(new_name))]
            }
            ChangeOperation::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                q(table),
                self.column_sql(column)
            )],
            ChangeOperation::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                q(table),
                q(&column.name)
            )],
            ChangeOperation::RenameColumn {
                table,
                name,
                new_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                q(table),
                q(name),
                q(new_name)
            )],
            ChangeOperation::AlterColumn { table, from, to } => {
                self.alter_column_sql(table, from, to)
            }
            ChangeOperation::AddIndex { table, index } => {
                vec![self.create_index_sql(table, index)]
            }
            ChangeOperation::DropIndex { index, .. } => vec![self.drop_index_sql(&index.name)],
            ChangeOperation::RenameIndex { name, new_name, .. } => {
                vec![format!("ALTER INDEX {} RENAME TO {}", q(name), q(new_name))]
            }
            ChangeOperation::AddForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {} ADD {}",
                q(table),
                self.foreign_key_clause(foreign_key)
            )],
            ChangeOperation::DropForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                q(table),
                q(&foreign_key.name)
            )],
            ChangeOperation::AddPrimaryKey { table, primary_key } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                q(table),
                q(&primary_key.name),
                self.column_list(&primary_key.columns)
            )],
            ChangeOperation::DropPrimaryKey { table, primary_key } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                q(table),
                q(&primary_key.name)
            )],
            ChangeOperation::Sql { up, .. } => vec![up.clone()],
        };
        Ok(statements)
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        match column.column_type {
            ColumnType::Integer => "integer".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::SmallInt => "smallint".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::String => match column.max_length {
                Some(n) => format!("varchar({n})"),
                None => "text".to_string(),
            },
            ColumnType::Decimal => match (column.precision, column.scale) {
                (Some(p), Some(s)) => format!("numeric({p},{s})"),
                (Some(p), None) => format!("numeric({p})"),
                _ => "numeric".to_string(),
            },
            ColumnType::Real => "real".to_string(),
            ColumnType::Double => "double precision".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Time => "time".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::TimestampTz => "timestamptz".to_string(),
            ColumnType::Uuid => "uuid".to_string(),
            ColumnType::Binary => "bytea".to_string(),
            ColumnType::Json => "jsonb".to_string(),
        }
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "TRUE" } else { "FALSE" }
    }

    fn timestamp_type(&self) -> &'static str {
        "timestamptz"
    }

    fn table_exists_sql(&self, table: &str) -> String {
        format!(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = {}",
            self.quote_literal(table)
        )
    }
}
