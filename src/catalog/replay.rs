//! Catalog replay engine: applies change operations to mutate the catalog.
//!
//! Replay is strict. Every operation is checked against the current state
//! before anything is mutated, so a failed [`apply`] leaves the catalog as it
//! was. Drops must carry the exact definition of what they remove; that is
//! what makes every drop invertible. The planner replays a whole run before
//! touching the database, which turns replay into plan-time validation of
//! table, column and foreign-key references.

use crate::catalog::types::*;
use crate::operation::{
    ChangeOperation, ColumnDef, ForeignKeyDef, IndexDef, PrimaryKeyDef, TableDef,
};
use std::collections::HashSet;
use thiserror::Error;


/// An operation that does not fit the schema it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table `{table}` does not exist")]
    UnknownTable { table: String },

    #[error("table `{table}` already exists")]
    TableExists { table: String },

    #[error("column `{table}.{column}` does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("column `{table}.{column}` already exists")]
    ColumnExists { table: String, column: String },

    #[error("index `{index}` does not exist on `{table}`")]
    UnknownIndex { table: String, index: String },

    #[error("index `{index}` already exists")]
    IndexExists { index: String },

    #[error("foreign key `{foreign_key}` does not exist on `{table}`")]
    UnknownForeignKey { table: String, foreign_key: String },

    #[error("foreign key `{foreign_key}` already exists on `{table}`")]
    ForeignKeyExists { table: String, foreign_key: String },

    #[error("table `{table}` has no primary key")]
    NoPrimaryKey { table: String },

    #[error("table `{table}` already has primary key `{primary_key}`")]
    PrimaryKeyExists { table: String, primary_key: String },

    #[error("`{table}` is still referenced by foreign key `{foreign_key}` on `{referenced_by}`")]
    StillReferenced {
        table: String,
        referenced_by: String,
        foreign_key: String,
    },

    #[error("column `{table}.{column}` is used by {used_by}")]
    ColumnInUse {
        table: String,
        column: String,
        used_by: String,
    },

    #[error("{object} does not match its current definition")]
    DefinitionMismatch { object: String },

    #[error("cannot drop `{table}.{column}`: a table must keep at least one column")]
    LastColumn { table: String, column: String },

    #[error("invalid {object}: {reason}")]
    Invalid { object: String, reason: String },
}

/// Apply a single operation to the catalog.
///
/// On error the catalog is left untouched.
pub fn apply(catalog: &mut Catalog, op: &ChangeOperation) -> Result<(), SchemaError> {
    match op {
        ChangeOperation::CreateTable(def) => apply_create_table(catalog, def),
        ChangeOperation::DropTable(def) => apply_drop_table(catalog, def),
        ChangeOperation::RenameTable { name, new_name } => {
            apply_rename_table(catalog, name, new_name)
        }
        ChangeOperation::AddColumn { table, column } => apply_add_column(catalog, table, column),
        ChangeOperation::DropColumn { table, column } => apply_drop_column(catalog, table, column),
        ChangeOperation::RenameColumn {
            table,
            name,
            new_name,
        } => apply_rename_column(catalog, table, name, new_name),
        ChangeOperation::AlterColumn { table, from, to } => {
            apply_alter_column(catalog, table, from, to)
        }
        ChangeOperation::AddIndex { table, index } => apply_add_index(catalog, table, index),
        ChangeOperation::DropIndex { table, index } => apply_drop_index(catalog, table, index),
        ChangeOperation::RenameIndex {
            table,
            name,
            new_name,
        } => apply_rename_index(catalog, table, name, new_name),
        ChangeOperation::AddForeignKey { table, foreign_key } => {
            apply_add_foreign_key(catalog, table, foreign_key)
        }
        ChangeOperation::DropForeignKey { table, foreign_key } => {
            apply_drop_foreign_key(catalog, table, foreign_key)
        }
        ChangeOperation::AddPrimaryKey { table, primary_key } => {
            apply_add_primary_key(catalog, table, primary_key)
        }
        ChangeOperation::DropPrimaryKey { table, primary_key } => {
            apply_drop_primary_key(catalog, table, primary_key)
        }
        // Opaque SQL is invisible to the schema model.
        ChangeOperation::Sql { .. } => Ok(()),
    }
}

/// Apply operations in order. All or nothing: on error the catalog is unchanged.
///
/// The error carries the position of the failing operation.
pub fn apply_all(
    catalog: &mut Catalog,
    ops: &[ChangeOperation],
) -> Result<(), (usize, SchemaError)> {
    let mut scratch = catalog.clone();
    for (i, op) in ops.iter().enumerate() {
        apply(&mut scratch, op).map_err(|e| (i, e))?;
    }
    *catalog = scratch;
    Ok(())
}

fn table_ref<'a>(catalog: &'a Catalog, table: &str) -> Result<&'a TableState, SchemaError> {
    catalog
        .get_table(table)
        .ok_or_else(|| SchemaError::UnknownTable {
            table: table.to_string(),
        })
}

fn table_mut<'a>(catalog: &'a mut Catalog, table: &str) -> Result<&'a mut TableState, SchemaError> {
    catalog
        .get_table_mut(table)
        .ok_or_else(|| SchemaError::UnknownTable {
            table: table.to_string(),
        })
}

fn require_columns(table: &TableState, columns: &[String]) -> Result<(), SchemaError> {
    if columns.is_empty() {
        return Err(SchemaError::Invalid {
            object: format!("key on `{}`", table.name),
            reason: "column list is empty".to_string(),
        });
    }
    match columns.iter().find(|c| !table.has_column(c)) {
        Some(missing) => Err(SchemaError::UnknownColumn {
            table: table.name.clone(),
            column: missing.clone(),
        }),
        None => Ok(()),
    }
}

/// Check a foreign key against its owning table and the referenced table.
/// `owner` stands in for the referenced table on self-references, since the
/// owner may not be in the catalog yet.
fn validate_foreign_key(
    catalog: &Catalog,
    owner: &TableState,
    fk: &ForeignKeyDef,
) -> Result<(), SchemaError> {
    require_columns(owner, &fk.columns)?;
    let target = if fk.ref_table == owner.name {
        owner
    } else {
        table_ref(catalog, &fk.ref_table)?
    };
    require_columns(target, &fk.ref_columns)?;
    if fk.columns.len() != fk.ref_columns.len() {
        return Err(SchemaError::Invalid {
            object: format!("foreign key `{}`", fk.name),
            reason: format!(
                "{} column(s) reference {} column(s)",
                fk.columns.len(),
                fk.ref_columns.len()
            ),
        });
    }
    Ok(())
}

/// Fail if any other table has a foreign key into `table`.
fn ensure_unreferenced(catalog: &Catalog, table: &str) -> Result<(), SchemaError> {
    match catalog.referencing_foreign_keys(table).first() {
        Some((referenced_by, fk)) => Err(SchemaError::StillReferenced {
            table: table.to_string(),
            referenced_by: referenced_by.to_string(),
            foreign_key: fk.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Handle CREATE TABLE: validate the whole definition, then insert it.
fn apply_create_table(catalog: &mut Catalog, def: &TableDef) -> Result<(), SchemaError> {
    if catalog.has_table(&def.name) {
        return Err(SchemaError::TableExists {
            table: def.name.clone(),
        });
    }
    if def.columns.is_empty() {
        return Err(SchemaError::Invalid {
            object: format!("table `{}`", def.name),
            reason: "a table needs at least one column".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for col in &def.columns {
        if !seen.insert(col.name.as_str()) {
            return Err(SchemaError::ColumnExists {
                table: def.name.clone(),
                column: col.name.clone(),
            });
        }
    }

    let table = TableState::from_def(def);
    if let Some(pk) = &table.primary_key {
        require_columns(&table, &pk.columns)?;
    }

    let mut fk_names = HashSet::new();
    for fk in &table.foreign_keys {
        if !fk_names.insert(fk.name.as_str()) {
            return Err(SchemaError::ForeignKeyExists {
                table: def.name.clone(),
                foreign_key: fk.name.clone(),
            });
        }
        validate_foreign_key(catalog, &table, fk)?;
    }

    let mut index_names = HashSet::new();
    for idx in &table.indexes {
        if catalog.table_for_index(&idx.name).is_some() || !index_names.insert(idx.name.as_str()) {
            return Err(SchemaError::IndexExists {
                index: idx.name.clone(),
            });
        }
        require_columns(&table, &idx.columns)?;
    }

    catalog.insert_table(table);
    Ok(())
}

/// Handle DROP TABLE: the carried definition must match, and no other table
/// may still point at this one.
fn apply_drop_table(catalog: &mut Catalog, def: &TableDef) -> Result<(), SchemaError> {
    let table = table_ref(catalog, &def.name)?;
    if *table != TableState::from_def(def) {
        return Err(SchemaError::DefinitionMismatch {
            object: format!("table `{}`", def.name),
        });
    }
    ensure_unreferenced(catalog, &def.name)?;
    catalog.remove_table(&def.name);
    Ok(())
}

/// Handle RENAME TABLE: move the table state to a new key and repoint every
/// foreign key that referenced the old name, including self-references.
fn apply_rename_table(catalog: &mut Catalog, name: &str, new_name: &str) -> Result<(), SchemaError> {
    table_ref(catalog, name)?;
    if catalog.has_table(new_name) {
        return Err(SchemaError::TableExists {
            table: new_name.to_string(),
        });
    }

    let Some(mut table) = catalog.remove_table(name) else {
        return Err(SchemaError::UnknownTable {
            table: name.to_string(),
        });
    };
    table.name = new_name.to_string();
    for fk in &mut table.foreign_keys {
        if fk.ref_table == name {
            fk.ref_table = new_name.to_string();
        }
    }
    catalog.insert_table(table);

    let others: Vec<String> = catalog.table_names().map(str::to_string).collect();
    for other in others {
        if let Some(t) = catalog.get_table_mut(&other) {
            for fk in &mut t.foreign_keys {
                if fk.ref_table == name {
                    fk.ref_table = new_name.to_string();
                }
            }
        }
    }
    Ok(())
}

fn apply_add_column(catalog: &mut Catalog, table: &str, column: &ColumnDef) -> Result<(), SchemaError> {
    let state = table_mut(catalog, table)?;
    if state.has_column(&column.name) {
        return Err(SchemaError::ColumnExists {
            table: table.to_string(),
            column: column.name.clone(),
        });
    }
    state.columns.push(column.clone());
    Ok(())
}

/// Handle DROP COLUMN. Refuses to silently cascade: any key, index or
/// foreign key that still uses the column must be dropped first.
fn apply_drop_column(catalog: &mut Catalog, table: &str, column: &ColumnDef) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    let current = state
        .get_column(&column.name)
        .ok_or_else(|| SchemaError::UnknownColumn {
            table: table.to_string(),
            column: column.name.clone(),
        })?;
    if current != column {
        return Err(SchemaError::DefinitionMismatch {
            object: format!("column `{}.{}`", table, column.name),
        });
    }
    if let Some(used_by) = state.column_user(&column.name) {
        return Err(SchemaError::ColumnInUse {
            table: table.to_string(),
            column: column.name.clone(),
            used_by,
        });
    }
    if let Some((referenced_by, fk)) = catalog
        .referencing_foreign_keys(table)
        .into_iter()
        .find(|(_, fk)| fk.ref_columns.contains(&column.name))
    {
        return Err(SchemaError::ColumnInUse {
            table: table.to_string(),
            column: column.name.clone(),
            used_by: format!("foreign key `{}` on `{}`", fk.name, referenced_by),
        });
    }
    if state.columns.len() == 1 {
        return Err(SchemaError::LastColumn {
            table: table.to_string(),
            column: column.name.clone(),
        });
    }

    let state = table_mut(catalog, table)?;
    state.columns.retain(|c| c.name != column.name);
    Ok(())
}

/// Handle RENAME COLUMN: rename a column in a table, updating keys, indexes,
/// partial-index predicates and foreign keys in other tables that point at it.
fn apply_rename_column(
    catalog: &mut Catalog,
    table: &str,
    old_name: &str,
    new_name: &str,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    if !state.has_column(old_name) {
        return Err(SchemaError::UnknownColumn {
            table: table.to_string(),
            column: old_name.to_string(),
        });
    }
    if state.has_column(new_name) {
        return Err(SchemaError::ColumnExists {
            table: table.to_string(),
            column: new_name.to_string(),
        });
    }

    let rename = |cols: &mut Vec<String>| {
        for col in cols.iter_mut() {
            if col == old_name {
                *col = new_name.to_string();
            }
        }
    };

    let state = table_mut(catalog, table)?;
    if let Some(col) = state.get_column_mut(old_name) {
        col.name = new_name.to_string();
    }
    if let Some(pk) = &mut state.primary_key {
        rename(&mut pk.columns);
    }
    for fk in &mut state.foreign_keys {
        rename(&mut fk.columns);
    }
    for idx in &mut state.indexes {
        rename(&mut idx.columns);
        if let Some(filter) = &idx.filter {
            idx.filter = Some(replace_column_in_expression(filter, old_name, new_name));
        }
    }

    // Foreign keys anywhere (self-references included) that point at the column.
    let names: Vec<String> = catalog.table_names().map(str::to_string).collect();
    for name in names {
        if let Some(t) = catalog.get_table_mut(&name) {
            for fk in &mut t.foreign_keys {
                if fk.ref_table == table {
                    rename(&mut fk.ref_columns);
                }
            }
        }
    }
    Ok(())
}

fn apply_alter_column(
    catalog: &mut Catalog,
    table: &str,
    from: &ColumnDef,
    to: &ColumnDef,
) -> Result<(), SchemaError> {
    if from.name != to.name {
        return Err(SchemaError::Invalid {
            object: format!("alter of `{}.{}`", table, from.name),
            reason: format!("use rename_column to rename it to `{}`", to.name),
        });
    }
    let state = table_mut(catalog, table)?;
    let current = state
        .get_column_mut(&from.name)
        .ok_or_else(|| SchemaError::UnknownColumn {
            table: table.to_string(),
            column: from.name.clone(),
        })?;
    if current != from {
        return Err(SchemaError::DefinitionMismatch {
            object: format!("column `{}.{}`", table, from.name),
        });
    }
    *current = to.clone();
    Ok(())
}

/// Handle ADD INDEX. Index names are unique across the whole schema.
fn apply_add_index(catalog: &mut Catalog, table: &str, index: &IndexDef) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    if catalog.table_for_index(&index.name).is_some() {
        return Err(SchemaError::IndexExists {
            index: index.name.clone(),
        });
    }
    require_columns(state, &index.columns)?;

    table_mut(catalog, table)?.indexes.push(index.clone());
    catalog.register_index(&index.name, table);
    Ok(())
}

fn apply_drop_index(catalog: &mut Catalog, table: &str, index: &IndexDef) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    let current = state
        .get_index(&index.name)
        .ok_or_else(|| SchemaError::UnknownIndex {
            table: table.to_string(),
            index: index.name.clone(),
        })?;
    if current != index {
        return Err(SchemaError::DefinitionMismatch {
            object: format!("index `{}`", index.name),
        });
    }

    table_mut(catalog, table)?
        .indexes
        .retain(|idx| idx.name != index.name);
    catalog.unregister_index(&index.name);
    Ok(())
}

fn apply_rename_index(
    catalog: &mut Catalog,
    table: &str,
    old_name: &str,
    new_name: &str,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    if state.get_index(old_name).is_none() {
        return Err(SchemaError::UnknownIndex {
            table: table.to_string(),
            index: old_name.to_string(),
        });
    }
    if catalog.table_for_index(new_name).is_some() {
        return Err(SchemaError::IndexExists {
            index: new_name.to_string(),
        });
    }

    let state = table_mut(catalog, table)?;
    if let Some(idx) = state.indexes.iter_mut().find(|idx| idx.name == old_name) {
        idx.name = new_name.to_string();
    }
    catalog.unregister_index(old_name);
    catalog.register_index(new_name, table);
    Ok(())
}

fn apply_add_foreign_key(
    catalog: &mut Catalog,
    table: &str,
    fk: &ForeignKeyDef,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    if state.get_foreign_key(&fk.name).is_some() {
        return Err(SchemaError::ForeignKeyExists {
            table: table.to_string(),
            foreign_key: fk.name.clone(),
        });
    }
    validate_foreign_key(catalog, state, fk)?;

    table_mut(catalog, table)?.foreign_keys.push(fk.clone());
    Ok(())
}

fn apply_drop_foreign_key(
    catalog: &mut Catalog,
    table: &str,
    fk: &ForeignKeyDef,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    let current = state
        .get_foreign_key(&fk.name)
        .ok_or_else(|| SchemaError::UnknownForeignKey {
            table: table.to_string(),
            foreign_key: fk.name.clone(),
        })?;
    if current != fk {
        return Err(SchemaError::DefinitionMismatch {
            object: format!("foreign key `{}`", fk.name),
        });
    }

    table_mut(catalog, table)?
        .foreign_keys
        .retain(|f| f.name != fk.name);
    Ok(())
}

fn apply_add_primary_key(
    catalog: &mut Catalog,
    table: &str,
    pk: &PrimaryKeyDef,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    if let Some(existing) = &state.primary_key {
        return Err(SchemaError::PrimaryKeyExists {
            table: table.to_string(),
            primary_key: existing.name.clone(),
        });
    }
    require_columns(state, &pk.columns)?;

    table_mut(catalog, table)?.primary_key = Some(pk.clone());
    Ok(())
}

/// Handle DROP PRIMARY KEY. Foreign keys (self-references included) that
/// target the table depend on its key and must be dropped first.
fn apply_drop_primary_key(
    catalog: &mut Catalog,
    table: &str,
    pk: &PrimaryKeyDef,
) -> Result<(), SchemaError> {
    let state = table_ref(catalog, table)?;
    match &state.primary_key {
        None => {
            return Err(SchemaError::NoPrimaryKey {
                table: table.to_string(),
            });
        }
        Some(current) if current != pk => {
            return Err(SchemaError::DefinitionMismatch {
                object: format!("primary key `{}`", pk.name),
            });
        }
        Some(_) => {}
    }
    if let Some(fk) = state.foreign_keys.iter().find(|fk| fk.ref_table == table) {
        return Err(SchemaError::StillReferenced {
            table: table.to_string(),
            referenced_by: table.to_string(),
            foreign_key: fk.name.clone(),
        });
    }
    ensure_unreferenced(catalog, table)?;

    table_mut(catalog, table)?.primary_key = None;
    Ok(())
}

/// Replace a column name in an expression string, respecting word boundaries.
///
/// Splits the expression into identifier tokens (alphanumeric + underscore)
/// and non-identifier separators. Tokens matching `old` are replaced with `new`.
/// Renaming `Id` won't affect `StudentId`.
pub(crate) fn replace_column_in_expression(expression: &str, old: &str, new: &str) -> String {
    let mut result = String::with_capacity(expression.len());
    let mut token = String::new();

    for ch in expression.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            token.push(ch);
        } else {
            flush_token(&mut token, &mut result, old, new);
            result.push(ch);
        }
    }
    flush_token(&mut token, &mut result, old, new);
    result
}

fn flush_token(token: &mut String, result: &mut String, old: &str, new: &str) {
    if token.is_empty() {
        return;
    }
    if token.as_str() == old {
        result.push_str(new);
    } else {
        result.push_str(token);
    }
    token.clear();
}
