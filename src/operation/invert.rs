//! Structural inverses of change operations.

use super::ChangeOperation;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvertError {
    #[error("`{operation}` has no structural inverse; write the down steps explicitly")]
    NotInvertible { operation: String },
}

impl ChangeOperation {
    /// Return the operation that undoes `self` structurally.
    ///
    /// Only opaque SQL without a `down` statement fails.
    pub fn invert(&self) -> Result<ChangeOperation, InvertError> {
        let inverse = match self {
            Self::CreateTable(def) => Self::DropTable(def.clone()),
            Self::DropTable(def) => Self::CreateTable(def.clone()),
            Self::RenameTable { name, new_name } => Self::RenameTable {
                name: new_name.clone(),
                new_name: name.clone(),
            },
            Self::AddColumn { table, column } => Self::DropColumn {
                table: table.clone(),
                column: column.clone(),
            },
            Self::DropColumn { table, column } => Self::AddColumn {
                table: table.clone(),
                column: column.clone(),
            },
            Self::RenameColumn {
                table,
                name,
                new_name,
            } => Self::RenameColumn {
                table: table.clone(),
                name: new_name.clone(),
                new_name: name.clone(),
            },
            Self::AlterColumn { table, from, to } => Self::AlterColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            Self::AddIndex { table, index } => Self::DropIndex {
                table: table.clone(),
                index: index.clone(),
            },
            Self::DropIndex { table, index } => Self::AddIndex {
                table: table.clone(),
                index: index.clone(),
            },
            Self::RenameIndex {
                table,
                name,
                new_name,
            } => Self::RenameIndex {
                table: table.clone(),
                name: new_name.clone(),
                new_name: name.clone(),
            },
            Self::AddForeignKey { table, foreign_key } => Self::DropForeignKey {
                table: table.clone(),
                foreign_key: foreign_key.clone(),
            },
            Self::DropForeignKey { table, foreign_key } => Self::AddForeignKey {
                table: table.clone(),
                foreign_key: foreign_key.clone(),
            },
            Self::AddPrimaryKey { table, primary_key } => Self::DropPrimaryKey {
                table: table.clone(),
                primary_key: primary_key.clone(),
            },
            Self::DropPrimaryKey { table, primary_key } => Self::AddPrimaryKey {
                table: table.clone(),
                primary_key: primary_key.clone(),
            },
            Self::Sql { up, down } => match down {
                Some(down) => Self::Sql {
                    up: down.clone(),
                    down: Some(up.clone()),
                },
                None => {
                    return Err(InvertError::NotInvertible {
                        operation: self.describe(),
                    });
                }
            },
        };
        Ok(inverse)
    }
}

/// Invert a whole sequence: reverse order, invert each step.
pub fn invert_all(operations: &[ChangeOperation]) -> Result<Vec<ChangeOperation>, InvertError> {
    operations.iter().rev().map(ChangeOperation::invert).collect()
}
