//! SQLite rendering.
//!
//! SQLite's `ALTER TABLE` cannot change a column or add and drop constraints,
//! so those operations rebuild the table: create the new shape under a scratch
//! name, copy the shared columns, drop the old table, rename, then recreate the
//! indexes. The new shape comes from replaying the operation on a copy of the
//! catalog. Rebuilds rely on `PRAGMA foreign_keys = OFF`, which the driver sets
//! when it opens the connection.

use super::{Dialect, DialectKind, RenderError};
use crate::catalog::{self, Catalog, TableState};
use crate::operation::{ChangeOperation, ColumnDef, ColumnType, DefaultExpr, TableDef};

const REBUILD_PREFIX: &str = "__rebuild_";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// An identity column is only expressible as the table's sole
    /// `INTEGER PRIMARY KEY AUTOINCREMENT`.
    fn inline_identity<'a>(
        &self,
        def: &'a TableDef,
        op: &ChangeOperation,
    ) -> Result<Option<&'a ColumnDef>, RenderError> {
        let identities: Vec<&ColumnDef> = def.columns.iter().filter(|c| c.identity).collect();
        match identities.as_slice() {
            [] => Ok(None),
            [column] => {
                let sole_key = def
                    .primary_key
                    .as_ref()
                    .is_some_and(|pk| pk.columns.len() == 1 && pk.columns[0] == column.name);
                if !sole_key {
                    return Err(RenderError::unsupported(
                        DialectKind::Sqlite,
                        op,
                        format!(
                            "identity column `{}` must be the single-column primary key",
                            column.name
                        ),
                    ));
                }
                if !matches!(
                    column.column_type,
                    ColumnType::Integer | ColumnType::BigInt | ColumnType::SmallInt
                ) {
                    return Err(RenderError::unsupported(
                        DialectKind::Sqlite,
                        op,
                        format!("identity column `{}` must be an integer", column.name),
                    ));
                }
                Ok(Some(*column))
            }
            _ => Err(RenderError::unsupported(
                DialectKind::Sqlite,
                op,
                "a table can have at most one identity column",
            )),
        }
    }

    fn column_sql(&self, column: &ColumnDef, inline_key: bool) -> String {
        if inline_key {
            return format!(
                "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                self.quote_ident(&column.name)
            );
        }
        let mut sql = format!("{} {}", self.quote_ident(&column.name), self.column_type(column));
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&self.default_sql(default));
        }
        sql
    }

    /// `CREATE TABLE` for `def`, stored under `name`. Indexes are not included.
    fn create_table_body(
        &self,
        name: &str,
        def: &TableDef,
        op: &ChangeOperation,
    ) -> Result<String, RenderError> {
        let identity = self.inline_identity(def, op)?;
        let mut lines: Vec<String> = def
            .columns
            .iter()
            .map(|c| self.column_sql(c, identity.is_some_and(|id| id.name == c.name)))
            .collect();
        if let Some(pk) = &def.primary_key
            && identity.is_none()
        {
            lines.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&pk.name),
                self.column_list(&pk.columns)
            ));
        }
        for fk in &def.foreign_keys {
            lines.push(self.foreign_key_clause(fk));
        }
        Ok(format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.quote_ident(name),
            lines.join(",\n    ")
        ))
    }

    fn create_table_sql(&self, def: &TableDef, op: &ChangeOperation) -> Result<Vec<String>, RenderError> {
        let mut statements = vec![self.create_table_body(&def.name, def, op)?];
        statements.extend(
            def.indexes
                .iter()
                .map(|idx| self.create_index_sql(&def.name, idx)),
        );
        Ok(statements)
    }

    /// Rebuild `table` into the shape it has after `op`.
    fn rebuild(
        &self,
        table: &str,
        op: &ChangeOperation,
        catalog: &Catalog,
    ) -> Result<Vec<String>, RenderError> {
        let Some(before) = catalog.get_table(table) else {
            return Err(RenderError::unsupported(
                DialectKind::Sqlite,
                op,
                format!("the shape of `{table}` is unknown, so it cannot be rebuilt"),
            ));
        };
        let mut scratch = catalog.clone();
        catalog::apply(&mut scratch, op)?;
        let Some(after) = scratch.get_table(table) else {
            return Err(RenderError::unsupported(
                DialectKind::Sqlite,
                op,
                format!("`{table}` does not exist after the change"),
            ));
        };
        self.rebuild_statements(before, after, op)
    }

    fn rebuild_statements(
        &self,
        before: &TableState,
        after: &TableState,
        op: &ChangeOperation,
    ) -> Result<Vec<String>, RenderError> {
        let temp = format!("{REBUILD_PREFIX}{}", after.name);
        let shared: Vec<String> = after
            .columns
            .iter()
            .filter(|c| before.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();
        let shared = self.column_list(&shared);

        let mut statements = vec![
            self.create_table_body(&temp, &after.to_def(), op)?,
            format!(
                "INSERT INTO {} ({shared}) SELECT {shared} FROM {}",
                self.quote_ident(&temp),
                self.quote_ident(&before.name)
            ),
            format!("DROP TABLE {}", self.quote_ident(&before.name)),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_ident(&temp),
                self.quote_ident(&after.name)
            ),
        ];
        statements.extend(
            after
                .indexes
                .iter()
                .map(|idx| self.create_index_sql(&after.name, idx)),
        );
        Ok(statements)
    }
}

/// Numbers and `NULL` are the only verbatim defaults `ADD COLUMN` accepts on
/// a populated table.
fn is_constant_expression(expr: &str) -> bool {
    let expr = expr.trim();
    expr.eq_ignore_ascii_case("null") || expr.parse::<f64>().is_ok()
}

impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn render(&self, op: &ChangeOperation, catalog: &Catalog) -> Result<Vec<String>, RenderError> {
        let q = |ident: &str| self.quote_ident(ident);
        let statements = match op {
            ChangeOperation::CreateTable(def) => self.create_table_sql(def, op)?,
            ChangeOperation::DropTable(def) => vec![format!("DROP TABLE {}", q(&def.name))],
            ChangeOperation::RenameTable { name, new_name } => {
                vec![format!("ALTER TABLE {} RENAME TO {}", q(name), q(new_name))]
            }
            ChangeOperation::AddColumn { table, column } => {
                if column.identity {
                    return Err(RenderError::unsupported(
                        DialectKind::Sqlite,
                        op,
                        "identity columns can only be declared when the table is created",
                    ));
                }
                let non_constant_default = matches!(
                    &column.default,
                    Some(DefaultExpr::Expression(expr)) if !is_constant_expression(expr)
                );
                if (!column.nullable && column.default.is_none()) || non_constant_default {
                    // ADD COLUMN refuses NOT NULL without a default, even on empty
                    // tables, and a non-constant default once the table has rows.
                    self.rebuild(table, op, catalog)?
                } else {
                    vec![format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        q(table),
                        self.column_sql(column, false)
                    )]
                }
            }
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
                if from.identity != to.identity {
                    return Err(RenderError::unsupported(
                        DialectKind::Sqlite,
                        op,
                        "identity can only be declared when the table is created",
                    ));
                }
                if self.column_sql(from, false) == self.column_sql(to, false) {
                    // Same storage class, nullability and default: nothing to do.
                    Vec::new()
                } else {
                    self.rebuild(table, op, catalog)?
                }
            }
            ChangeOperation::AddIndex { table, index } => {
                vec![self.create_index_sql(table, index)]
            }
            ChangeOperation::DropIndex { index, .. } => vec![self.drop_index_sql(&index.name)],
            ChangeOperation::RenameIndex {
                table,
                name,
                new_name,
            } => {
                let Some(index) = catalog.get_table(table).and_then(|t| t.get_index(name)) else {
                    return Err(RenderError::unsupported(
                        DialectKind::Sqlite,
                        op,
                        format!("the definition of index `{name}` is unknown"),
                    ));
                };
                let mut renamed = index.clone();
                renamed.name = new_name.clone();
                vec![
                    self.drop_index_sql(name),
                    self.create_index_sql(table, &renamed),
                ]
            }
            ChangeOperation::AddForeignKey { table, .. }
            | ChangeOperation::DropForeignKey { table, .. }
            | ChangeOperation::AddPrimaryKey { table, .. }
            | ChangeOperation::DropPrimaryKey { table, .. } => self.rebuild(table, op, catalog)?,
            ChangeOperation::Sql { up, .. } => vec![up.clone()],
        };
        Ok(statements)
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        let affinity = match column.column_type {
            ColumnType::Integer | ColumnType::BigInt | ColumnType::SmallInt | ColumnType::Boolean => {
                "INTEGER"
            }
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Real | ColumnType::Double => "REAL",
            ColumnType::Binary => "BLOB",
            ColumnType::Text
            | ColumnType::String
            | ColumnType::Date
            | ColumnType::Time
            | ColumnType::Timestamp
            | ColumnType::TimestampTz
            | ColumnType::Uuid
            | ColumnType::Json => "TEXT",
        };
        affinity.to_string()
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    fn timestamp_type(&self) -> &'static str {
        "TEXT"
    }

    fn table_exists_sql(&self, table: &str) -> String {
        format!(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = {}",
            self.quote_literal(table)
        )
    }
}
