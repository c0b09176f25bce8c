//! Change operations: the unit of schema mutation.
//!
//! A migration is an ordered list of [`ChangeOperation`]s. Each variant carries
//! exactly what a dialect needs to render it and what [`ChangeOperation::invert`]
//! needs to produce its structural inverse. Drops carry the full definition of
//! the object they remove, so dropping is as reversible as creating.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString, IntoStaticStr};

mod invert;

pub use invert::{InvertError, invert_all};

/// A single atomic, reversible schema mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeOperation {
    CreateTable(TableDef),
    DropTable(TableDef),
    RenameTable {
        name: String,
        new_name: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: ColumnDef,
    },
    RenameColumn {
        table: String,
        name: String,
        new_name: String,
    },
    /// Change type, nullability, default or identity of an existing column.
    /// `from` must describe the column as it currently is; `to` keeps the same name.
    AlterColumn {
        table: String,
        from: ColumnDef,
        to: ColumnDef,
    },
    AddIndex {
        table: String,
        index: IndexDef,
    },
    DropIndex {
        table: String,
        index: IndexDef,
    },
    RenameIndex {
        table: String,
        name: String,
        new_name: String,
    },
    AddForeignKey {
        table: String,
        foreign_key: ForeignKeyDef,
    },
    DropForeignKey {
        table: String,
        foreign_key: ForeignKeyDef,
    },
    AddPrimaryKey {
        table: String,
        primary_key: PrimaryKeyDef,
    },
    DropPrimaryKey {
        table: String,
        primary_key: PrimaryKeyDef,
    },
    /// Opaque SQL. Invisible to the catalog; only invertible when `down` is given.
    Sql {
        up: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        down: Option<String>,
    },
}

impl ChangeOperation {
    /// Snake-case variant name, as written in migration files (`op = "..."`).
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// The table this operation primarily acts on. `None` for opaque SQL.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::CreateTable(def) | Self::DropTable(def) => Some(&def.name),
            Self::RenameTable { name, .. } => Some(name),
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::RenameColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::AddIndex { table, .. }
            | Self::DropIndex { table, .. }
            | Self::RenameIndex { table, .. }
            | Self::AddForeignKey { table, .. }
            | Self::DropForeignKey { table, .. }
            | Self::AddPrimaryKey { table, .. }
            | Self::DropPrimaryKey { table, .. } => Some(table),
            Self::Sql { .. } => None,
        }
    }

    /// True if running this operation can discard stored data.
    ///
    /// Destructive operations still have a structural inverse; reverting them
    /// restores the shape of the schema but not the rows or values that were lost.
    pub fn is_destructive(&self) -> bool {
        match self {
            Self::DropTable(_) | Self::DropColumn { .. } => true,
            Self::AlterColumn { from, to, .. } => from.narrows_to(to),
            _ => false,
        }
    }

    /// One-line human description used in logs, reports and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable(def) => format!("create table {}", def.name),
            Self::DropTable(def) => format!("drop table {}", def.name),
            Self::RenameTable { name, new_name } => format!("rename table {name} to {new_name}"),
            Self::AddColumn { table, column } => {
                format!("add column {}.{} {}", table, column.name, column.column_type)
            }
            Self::DropColumn { table, column } => format!("drop column {}.{}", table, column.name),
            Self::RenameColumn {
                table,
                name,
                new_name,
            } => format!("rename column {table}.{name} to {new_name}"),
            Self::AlterColumn { table, to, .. } => format!("alter column {}.{}", table, to.name),
            Self::AddIndex { table, index } => format!("add index {} on {}", index.name, table),
            Self::DropIndex { table, index } => format!("drop index {} on {}", index.name, table),
            Self::RenameIndex {
                table,
                name,
                new_name,
            } => format!("rename index {name} on {table} to {new_name}"),
            Self::AddForeignKey { table, foreign_key } => format!(
                "add foreign key {} on {} referencing {}",
                foreign_key.name, table, foreign_key.ref_table
            ),
            Self::DropForeignKey { table, foreign_key } => {
                format!("drop foreign key {} on {}", foreign_key.name, table)
            }
            Self::AddPrimaryKey { table, primary_key } => {
                format!("add primary key {} on {}", primary_key.name, table)
            }
            Self::DropPrimaryKey { table, primary_key } => {
                format!("drop primary key {} on {}", primary_key.name, table)
            }
            Self::Sql { up, .. } => {
                let first_line = up.lines().next().unwrap_or_default().trim();
                format!("sql: {first_line}")
            }
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Full definition of a table. Carried by both `create_table` and `drop_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKeyDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.primary_key = Some(PrimaryKeyDef::new(name, columns));
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Semantic column type. Dialects map these to concrete type names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    SmallInt,
    Boolean,
    Text,
    /// Variable-length string; bounded when `max_length` is set.
    String,
    /// Exact numeric; uses `precision` and `scale` when set.
    Decimal,
    Real,
    Double,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Binary,
    Json,
}

impl ColumnType {
    /// Rank used to decide whether an integer conversion narrows.
    fn integer_width(self) -> Option<u8> {
        match self {
            ColumnType::SmallInt => Some(2),
            ColumnType::Integer => Some(4),
            ColumnType::BigInt => Some(8),
            _ => None,
        }
    }
}

/// Compact declarative column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    /// Database-generated sequence value (identity / autoincrement).
    #[serde(default, skip_serializing_if = "is_false")]
    pub identity: bool,
}

fn default_nullable() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ColumnDef {
    /// A nullable column with no default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            max_length: None,
            precision: None,
            scale: None,
            identity: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: DefaultExpr) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }

    /// True if converting a column shaped like `self` into `to` can lose values.
    pub fn narrows_to(&self, to: &ColumnDef) -> bool {
        if self.column_type != to.column_type {
            return match (
                self.column_type.integer_width(),
                to.column_type.integer_width(),
            ) {
                (Some(from), Some(to)) => to < from,
                _ => !matches!(
                    (self.column_type, to.column_type),
                    (ColumnType::String, ColumnType::Text)
                ),
            };
        }
        let shrinks = |from: Option<u32>, to: Option<u32>| match (from, to) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => b < a,
            _ => false,
        };
        shrinks(self.max_length, to.max_length)
            || shrinks(
                self.precision.map(u32::from),
                to.precision.map(u32::from),
            )
            || shrinks(self.scale.map(u32::from), to.scale.map(u32::from))
    }
}

/// Column default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultExpr {
    /// A string constant, rendered as a quoted literal.
    Text(String),
    /// A boolean constant, rendered per dialect.
    Bool(bool),
    /// Verbatim SQL: numbers, `CURRENT_TIMESTAMP`, function calls.
    Expression(String),
}

/// Action taken on referencing rows when the referenced row changes.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[strum(serialize = "CASCADE")]
    Cascade,
    #[strum(serialize = "RESTRICT")]
    Restrict,
    #[strum(serialize = "SET NULL")]
    SetNull,
    #[default]
    #[strum(serialize = "NO ACTION")]
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
}

impl ForeignKeyDef {
    pub fn new(
        name: impl Into<String>,
        columns: &[&str],
        ref_table: impl Into<String>,
        ref_columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ref_table: ref_table.into(),
            ref_columns: ref_columns.iter().map(|c| c.to_string()).collect(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Partial-index predicate, verbatim SQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            filter: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Same definition under a possibly different name.
    pub fn same_shape(&self, other: &IndexDef) -> bool {
        self.columns == other.columns && self.unique == other.unique && self.filter == other.filter
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrimaryKeyDef {
    pub name: String,
    pub columns: Vec<String>,
}

impl PrimaryKeyDef {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}
