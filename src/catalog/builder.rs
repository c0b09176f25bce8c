//! Test harness for building catalog state
//!
//! Fluent API for constructing a [`Catalog`] directly, without replaying
//! operations. Type names are the snake-case [`ColumnType`] names.
//!
//! ```ignore
//! let catalog = CatalogBuilder::new()
//!     .table("Classes", |t| {
//!         t.column("Id", "integer", false)
//!             .column("BranchId", "integer", false)
//!             .pk("PK_Classes", &["Id"])
//!             .fk("FK_Classes_Branches", &["BranchId"], "Branches", &["Id"]);
//!     })
//!     .build();
//! ```

use crate::catalog::types::{Catalog, TableState};
use crate::operation::{ColumnDef, ColumnType, DefaultExpr, ForeignKeyDef, IndexDef, PrimaryKeyDef};

/// Builder for constructing a Catalog in tests
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
        }
    }

    /// Add a table to the catalog. The closure receives a TableBuilder
    /// to configure columns, indexes, and constraints.
    pub fn table(mut self, name: &str, f: impl FnOnce(&mut TableBuilder)) -> Self {
        let mut builder = TableBuilder::new(name);
        f(&mut builder);
        self.catalog.insert_table(builder.build());
        self
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for constructing a TableState in tests
pub struct TableBuilder {
    state: TableState,
}

impl TableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            state: TableState {
                name: name.to_string(),
                columns: vec![],
                primary_key: None,
                foreign_keys: vec![],
                indexes: vec![],
            },
        }
    }

    fn parse_type(type_name: &str) -> ColumnType {
        type_name
            .parse()
            .unwrap_or_else(|_| panic!("unknown column type `{type_name}`"))
    }

    /// Add a column without a default value
    pub fn column(&mut self, name: &str, type_name: &str, nullable: bool) -> &mut Self {
        let mut column = ColumnDef::new(name, Self::parse_type(type_name));
        column.nullable = nullable;
        self.state.columns.push(column);
        self
    }

    /// Add a column with a default value
    pub fn column_with_default(
        &mut self,
        name: &str,
        type_name: &str,
        nullable: bool,
        default: DefaultExpr,
    ) -> &mut Self {
        let mut column = ColumnDef::new(name, Self::parse_type(type_name)).with_default(default);
        column.nullable = nullable;
        self.state.columns.push(column);
        self
    }

    /// Add a fully specified column
    pub fn column_def(&mut self, column: ColumnDef) -> &mut Self {
        self.state.columns.push(column);
        self
    }

    pub fn index(&mut self, name: &str, columns: &[&str], unique: bool) -> &mut Self {
        let mut index = IndexDef::new(name, columns);
        index.unique = unique;
        self.state.indexes.push(index);
        self
    }

    /// Add a partial index
    pub fn filtered_index(&mut self, name: &str, columns: &[&str], filter: &str) -> &mut Self {
        self.state
            .indexes
            .push(IndexDef::new(name, columns).with_filter(filter));
        self
    }

    pub fn pk(&mut self, name: &str, columns: &[&str]) -> &mut Self {
        self.state.primary_key = Some(PrimaryKeyDef::new(name, columns));
        self
    }

    pub fn fk(
        &mut self,
        name: &str,
        columns: &[&str],
        ref_table: &str,
        ref_columns: &[&str],
    ) -> &mut Self {
        self.state
            .foreign_keys
            .push(ForeignKeyDef::new(name, columns, ref_table, ref_columns));
        self
    }

    pub fn build(self) -> TableState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_builder_basic() {
        let catalog = CatalogBuilder::new()
            .table("Students", |t| {
                t.column("Id", "integer", false).pk("PK_Students", &["Id"]);
            })
            .build();

        assert!(catalog.has_table("Students"));
        let table = catalog.get_table("Students").unwrap();
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].name, "Id");
        assert_eq!(table.columns[0].column_type, ColumnType::Integer);
        assert!(table.primary_key.is_some());
    }

    #[test]
    fn test_catalog_builder_registers_indexes() {
        let catalog = CatalogBuilder::new()
            .table("Branches", |t| {
                t.column("Id", "integer", false).pk("PK_Branches", &["Id"]);
            })
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("BranchId", "integer", false)
                    .column("Name", "string", true)
                    .pk("PK_Classes", &["Id"])
                    .fk("FK_Classes_Branches", &["BranchId"], "Branches", &["Id"])
                    .index("IX_Classes_BranchId", &["BranchId"], false);
            })
            .build();

        let classes = catalog.get_table("Classes").unwrap();
        assert_eq!(classes.columns.len(), 3);
        assert_eq!(classes.indexes.len(), 1);
        assert_eq!(classes.foreign_keys.len(), 1);
        assert_eq!(catalog.table_for_index("IX_Classes_BranchId"), Some("Classes"));
    }
}
