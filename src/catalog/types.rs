//! Catalog types
//!
//! The catalog is the schema model: the shape of every table at one point in
//! migration history. It is built by replaying change operations in order and
//! is compared structurally by the diff planner and the round-trip tests.

use crate::operation::{ColumnDef, ForeignKeyDef, IndexDef, PrimaryKeyDef, TableDef};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableState>,
    /// Reverse lookup: index name → owning table. Index names are schema-global.
    index_to_table: HashMap<String, String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog directly from table definitions, without validation.
    pub fn from_defs<'a>(defs: impl IntoIterator<Item = &'a TableDef>) -> Self {
        let mut catalog = Self::new();
        for def in defs {
            catalog.insert_table(TableState::from_def(def));
        }
        catalog
    }

    pub fn get_table(&self, name: &str) -> Option<&TableState> {
        self.tables.get(name)
    }

    pub fn get_table_mut(&mut self, name: &str) -> Option<&mut TableState> {
        self.tables.get_mut(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn insert_table(&mut self, table: TableState) {
        for idx in &table.indexes {
            self.index_to_table
                .insert(idx.name.clone(), table.name.clone());
        }
        self.tables.insert(table.name.clone(), table);
    }

    pub fn remove_table(&mut self, name: &str) -> Option<TableState> {
        let table = self.tables.remove(name)?;
        for idx in &table.indexes {
            self.index_to_table.remove(&idx.name);
        }
        Some(table)
    }

    pub fn register_index(&mut self, index_name: &str, table_name: &str) {
        self.index_to_table
            .insert(index_name.to_string(), table_name.to_string());
    }

    pub fn unregister_index(&mut self, index_name: &str) {
        self.index_to_table.remove(index_name);
    }

    /// Look up which table owns a given index.
    pub fn table_for_index(&self, index_name: &str) -> Option<&str> {
        self.index_to_table.get(index_name).map(|s| s.as_str())
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableState> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Foreign keys on *other* tables that reference `table`.
    /// Returns `(referencing table, foreign key)` pairs.
    pub fn referencing_foreign_keys(&self, table: &str) -> Vec<(&str, &ForeignKeyDef)> {
        self.tables
            .values()
            .filter(|t| t.name != table)
            .flat_map(|t| {
                t.foreign_keys
                    .iter()
                    .filter(|fk| fk.ref_table == table)
                    .map(move |fk| (t.name.as_str(), fk))
            })
            .collect()
    }

    /// Table definitions in name order.
    pub fn to_defs(&self) -> Vec<TableDef> {
        self.tables.values().map(TableState::to_def).collect()
    }
}

/// Catalogs are equal when they hold structurally equal tables.
impl PartialEq for Catalog {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
    }
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<PrimaryKeyDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    pub indexes: Vec<IndexDef>,
}

impl TableState {
    pub fn from_def(def: &TableDef) -> Self {
        Self {
            name: def.name.clone(),
            columns: def.columns.clone(),
            primary_key: def.primary_key.clone(),
            foreign_keys: def.foreign_keys.clone(),
            indexes: def.indexes.clone(),
        }
    }

    pub fn to_def(&self) -> TableDef {
        TableDef {
            name: self.name.clone(),
            columns: self.columns.clone(),
            primary_key: self.primary_key.clone(),
            foreign_keys: self.foreign_keys.clone(),
            indexes: self.indexes.clone(),
        }
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_column_mut(&mut self, name: &str) -> Option<&mut ColumnDef> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    pub fn get_index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.name == name)
    }

    pub fn get_foreign_key(&self, name: &str) -> Option<&ForeignKeyDef> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    /// Name of the first index or constraint on this table that uses `column`,
    /// described for error messages. Partial-index predicates count as uses.
    pub fn column_user(&self, column: &str) -> Option<String> {
        if let Some(pk) = &self.primary_key
            && pk.columns.iter().any(|c| c == column)
        {
            return Some(format!("primary key `{}`", pk.name));
        }
        if let Some(fk) = self
            .foreign_keys
            .iter()
            .find(|fk| fk.columns.iter().any(|c| c == column))
        {
            return Some(format!("foreign key `{}`", fk.name));
        }
        if let Some(fk) = self
            .foreign_keys
            .iter()
            .find(|fk| fk.ref_table == self.name && fk.ref_columns.iter().any(|c| c == column))
        {
            return Some(format!("foreign key `{}`", fk.name));
        }
        self.indexes
            .iter()
            .find(|idx| {
                idx.columns.iter().any(|c| c == column)
                    || idx
                        .filter
                        .as_deref()
                        .is_some_and(|f| expression_mentions_column(f, column))
            })
            .map(|idx| format!("index `{}`", idx.name))
    }
}

/// Tables are compared structurally: column, index and foreign key order is
/// cosmetic and ignored.
impl PartialEq for TableState {
    fn eq(&self, other: &Self) -> bool {
        fn sorted<T: Clone, K: Ord>(items: &[T], key: impl Fn(&T) -> K) -> Vec<T> {
            let mut items = items.to_vec();
            items.sort_by_key(|item| key(item));
            items
        }

        self.name == other.name
            && self.primary_key == other.primary_key
            && sorted(&self.columns, |c| c.name.clone()) == sorted(&other.columns, |c| c.name.clone())
            && sorted(&self.indexes, |i| i.name.clone()) == sorted(&other.indexes, |i| i.name.clone())
            && sorted(&self.foreign_keys, |f| f.name.clone())
                == sorted(&other.foreign_keys, |f| f.name.clone())
    }
}

/// Check if an expression text contains a column name as an identifier.
///
/// Splits on non-identifier characters and checks for an exact token match.
/// This avoids false positives like `Id` matching `StudentId`.
pub(crate) fn expression_mentions_column(expression: &str, column: &str) -> bool {
    expression
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|token| token == column)
}
