//! Migrations: named, ordered, reversible units of schema change.

use crate::operation::{ChangeOperation, InvertError, invert_all};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

/// Length of the `YYYYMMDDHHMMSS` id prefix.
pub const TIMESTAMP_LEN: usize = 14;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid migration id `{id}`: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("invalid migration name `{name}`: use only letters, digits and underscores")]
    InvalidName { name: String },

    #[error("cannot derive down steps for `{id}`: {source}")]
    Invert {
        id: String,
        #[source]
        source: InvertError,
    },

    #[error("failed to serialize migration for checksum: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A migration as the runner sees it. Immutable once built: the checksum is
/// computed at construction from the id and both operation lists.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: String,
    pub name: String,
    up: Vec<ChangeOperation>,
    down: Vec<ChangeOperation>,
    /// True when `down` was computed from `up` rather than authored.
    pub down_derived: bool,
    pub run_in_transaction: bool,
    pub description: Option<String>,
    pub source_file: Option<PathBuf>,
    checksum: String,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    id: &'a str,
    up: &'a [ChangeOperation],
    down: &'a [ChangeOperation],
}

impl Migration {
    /// Build a migration whose down steps are derived from `up`.
    pub fn new(id: impl Into<String>, up: Vec<ChangeOperation>) -> Result<Self, MigrationError> {
        Self::from_parts(id, up, None)
    }

    /// Build a migration with explicitly authored down steps.
    pub fn with_down(
        id: impl Into<String>,
        up: Vec<ChangeOperation>,
        down: Vec<ChangeOperation>,
    ) -> Result<Self, MigrationError> {
        Self::from_parts(id, up, Some(down))
    }

    pub fn from_parts(
        id: impl Into<String>,
        up: Vec<ChangeOperation>,
        down: Option<Vec<ChangeOperation>>,
    ) -> Result<Self, MigrationError> {
        let id = id.into();
        let (_, name) = parse_id(&id)?;
        let name = name.to_string();

        let (down, down_derived) = match down {
            Some(down) => (down, false),
            None => {
                let derived = invert_all(&up).map_err(|source| MigrationError::Invert {
                    id: id.clone(),
                    source,
                })?;
                (derived, true)
            }
        };

        let checksum = compute_checksum(&id, &up, &down)?;
        Ok(Self {
            id,
            name,
            up,
            down,
            down_derived,
            run_in_transaction: true,
            description: None,
            source_file: None,
            checksum,
        })
    }

    pub fn non_transactional(mut self) -> Self {
        self.run_in_transaction = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_source_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_file = Some(path.into());
        self
    }

    pub fn up(&self) -> &[ChangeOperation] {
        &self.up
    }

    pub fn down(&self) -> &[ChangeOperation] {
        &self.down
    }

    /// SHA-256 hex of the canonical JSON of `{id, up, down}`.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Descriptions of the operations in `ops` that can lose data.
    pub fn data_loss(ops: &[ChangeOperation]) -> Vec<String> {
        ops.iter()
            .filter(|op| op.is_destructive())
            .map(ChangeOperation::describe)
            .collect()
    }
}

fn compute_checksum(
    id: &str,
    up: &[ChangeOperation],
    down: &[ChangeOperation],
) -> Result<String, MigrationError> {
    let canonical = serde_json::to_vec(&ChecksumInput { id, up, down })?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split an id into its timestamp and name parts.
pub fn parse_id(id: &str) -> Result<(&str, &str), MigrationError> {
    let invalid = |reason: &str| MigrationError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let Some((timestamp, name)) = id.split_at_checked(TIMESTAMP_LEN) else {
        return Err(invalid("expected `YYYYMMDDHHMMSS_name`"));
    };
    if !timestamp.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("expected a 14-digit timestamp prefix"));
    }
    let Some(name) = name.strip_prefix('_') else {
        return Err(invalid("expected `_` after the timestamp"));
    };
    if !valid_name(name) {
        return Err(invalid("the name may only use letters, digits and underscores"));
    }
    Ok((timestamp, name))
}

/// Id for a new migration created at `now`.
pub fn new_id(name: &str, now: DateTime<Utc>) -> Result<String, MigrationError> {
    if !valid_name(name) {
        return Err(MigrationError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(format!("{}_{}", now.format("%Y%m%d%H%M%S"), name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ColumnDef, ColumnType, TableDef};
    use chrono::TimeZone;

    fn add_email() -> ChangeOperation {
        ChangeOperation::AddColumn {
            table: "Parents".to_string(),
            column: ColumnDef::new("Email", ColumnType::String).with_max_length(256),
        }
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(
            parse_id("20240115143052_InitialCreate").unwrap(),
            ("20240115143052", "InitialCreate")
        );
        assert!(parse_id("20240115_InitialCreate").is_err());
        assert!(parse_id("2024011514305x_Init").is_err());
        assert!(parse_id("20240115143052-Init").is_err());
        assert!(parse_id("20240115143052_").is_err());
        assert!(parse_id("20240115143052_Add-Classes").is_err());
        assert!(parse_id("short").is_err());
    }

    #[test]
    fn test_new_id_uses_utc_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 52).unwrap();
        assert_eq!(
            new_id("AddClassesAndSchedules", now).unwrap(),
            "20240115143052_AddClassesAndSchedules"
        );
        assert!(matches!(
            new_id("add classes", now),
            Err(MigrationError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_down_is_derived_when_absent() {
        let m = Migration::new("20240101000000_AddEmail", vec![add_email()]).unwrap();
        assert!(m.down_derived);
        assert_eq!(m.down(), &[add_email().invert().unwrap()]);
        assert_eq!(m.name, "AddEmail");
    }

    #[test]
    fn test_underivable_down_is_an_error() {
        let up = vec![ChangeOperation::Sql {
            up: "UPDATE \"Parents\" SET \"Email\" = ''".to_string(),
            down: None,
        }];
        let err = Migration::new("20240101000000_Backfill", up).unwrap_err();
        assert!(matches!(err, MigrationError::Invert { .. }));

        let up = vec![ChangeOperation::Sql {
            up: "UPDATE \"Parents\" SET \"Email\" = ''".to_string(),
            down: None,
        }];
        assert!(Migration::with_down("20240101000000_Backfill", up, vec![]).is_ok());
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = Migration::new("20240101000000_AddEmail", vec![add_email()]).unwrap();
        let b = Migration::new("20240101000000_AddEmail", vec![add_email()]).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);

        let edited = Migration::new(
            "20240101000000_AddEmail",
            vec![ChangeOperation::AddColumn {
                table: "Parents".to_string(),
                column: ColumnDef::new("Email", ColumnType::String).with_max_length(512),
            }],
        )
        .unwrap();
        assert_ne!(a.checksum(), edited.checksum());

        // Transaction mode is not part of the content.
        assert_eq!(a.clone().non_transactional().checksum(), a.checksum());
    }

    #[test]
    fn test_data_loss_lists_destructive_steps() {
        let table = TableDef::new("Logs").column(ColumnDef::new("Message", ColumnType::Text));
        let ops = vec![
            ChangeOperation::CreateTable(table.clone()),
            ChangeOperation::DropTable(table),
        ];
        assert_eq!(Migration::data_loss(&ops), vec!["drop table Logs".to_string()]);
    }
}
