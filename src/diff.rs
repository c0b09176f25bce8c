//! Schema diff planner
//!
//! Computes the ordered list of operations that turns one catalog into
//! another. Every emitted operation is replayed on a working copy of the
//! current catalog as it is produced, so the output is valid by construction
//! and drop operations carry the exact definitions they remove.
//!
//! Emission order:
//! table renames, column renames, foreign key drops, index drops (or index
//! renames when only the name changed), primary key drops, table drops,
//! column drops, column alters, column adds, table creates, primary key adds,
//! index adds and finally foreign key adds.

use crate::catalog::{self, Catalog, SchemaError, TableState};
use crate::operation::{ChangeOperation, IndexDef};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Explicit rename hints, keyed by the desired (new) names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameHints {
    tables: BTreeMap<String, String>,
    columns: BTreeMap<(String, String), String>,
}

impl RenameHints {
    pub fn table(mut self, old: &str, new: &str) -> Self {
        self.tables.insert(new.to_string(), old.to_string());
        self
    }

    /// `table` is the table's desired name.
    pub fn column(mut self, table: &str, old: &str, new: &str) -> Self {
        self.columns
            .insert((table.to_string(), new.to_string()), old.to_string());
        self
    }

    pub fn old_table_name(&self, new: &str) -> Option<&str> {
        self.tables.get(new).map(String::as_str)
    }

    pub fn old_column_name(&self, table: &str, new: &str) -> Option<&str> {
        self.columns
            .get(&(table.to_string(), new.to_string()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.columns.is_empty()
    }
}

/// Operations that turn `current` into `desired`. Without hints a renamed
/// table or column shows up as a drop plus a create.
pub fn diff(current: &Catalog, desired: &Catalog) -> Result<Vec<ChangeOperation>, SchemaError> {
    diff_with_renames(current, desired, &RenameHints::default())
}

pub fn diff_with_renames(
    current: &Catalog,
    desired: &Catalog,
    hints: &RenameHints,
) -> Result<Vec<ChangeOperation>, SchemaError> {
    let mut planner = Planner {
        work: current.clone(),
        desired,
        ops: Vec::new(),
    };
    planner.rename_tables(hints)?;
    planner.rename_columns(hints)?;

    let matched: Vec<String> = planner
        .work
        .table_names()
        .filter(|name| desired.has_table(name))
        .map(str::to_string)
        .collect();
    let removed: Vec<String> = planner
        .work
        .table_names()
        .filter(|name| !desired.has_table(name))
        .map(str::to_string)
        .collect();
    let created: Vec<String> = desired
        .table_names()
        .filter(|name| !planner.work.has_table(name))
        .map(str::to_string)
        .collect();

    let keys_added: HashSet<String> = matched
        .iter()
        .filter_map(|name| planner.pair(name))
        .filter(|(current, wanted)| {
            wanted.primary_key.is_some() && current.primary_key != wanted.primary_key
        })
        .map(|(current, _)| current.name.clone())
        .collect();

    planner.drop_foreign_keys(&matched)?;
    planner.drop_indexes(&matched)?;
    planner.drop_primary_keys(&matched)?;
    planner.drop_tables(&removed)?;
    let held_back = planner.drop_columns(&matched)?;
    planner.alter_columns(&matched)?;
    planner.add_columns(&matched)?;
    for op in held_back {
        planner.emit(op)?;
    }
    let deferred = planner.create_tables(&created, &keys_added)?;
    planner.add_primary_keys(&matched)?;
    planner.add_indexes(&matched)?;
    planner.add_foreign_keys(deferred)?;

    debug!(operations = planner.ops.len(), "computed schema diff");
    Ok(planner.ops)
}

struct Planner<'a> {
    work: Catalog,
    desired: &'a Catalog,
    ops: Vec<ChangeOperation>,
}

impl Planner<'_> {
    fn emit(&mut self, op: ChangeOperation) -> Result<(), SchemaError> {
        catalog::apply(&mut self.work, &op)?;
        self.ops.push(op);
        Ok(())
    }

    fn emit_all(&mut self, ops: Vec<ChangeOperation>) -> Result<(), SchemaError> {
        ops.into_iter().try_for_each(|op| self.emit(op))
    }

    /// Working and desired state of a table present in both.
    fn pair(&self, name: &str) -> Option<(&TableState, &TableState)> {
        Some((self.work.get_table(name)?, self.desired.get_table(name)?))
    }

    fn rename_tables(&mut self, hints: &RenameHints) -> Result<(), SchemaError> {
        for (new, old) in &hints.tables {
            let applies = self.desired.has_table(new)
                && !self.desired.has_table(old)
                && self.work.has_table(old)
                && !self.work.has_table(new);
            if applies {
                self.emit(ChangeOperation::RenameTable {
                    name: old.clone(),
                    new_name: new.clone(),
                })?;
            }
        }
        Ok(())
    }

    fn rename_columns(&mut self, hints: &RenameHints) -> Result<(), SchemaError> {
        for ((table, new), old) in &hints.columns {
            let Some((current, wanted)) = self.pair(table) else {
                continue;
            };
            let applies = wanted.has_column(new)
                && !wanted.has_column(old)
                && current.has_column(old)
                && !current.has_column(new);
            if applies {
                self.emit(ChangeOperation::RenameColumn {
                    table: table.clone(),
                    name: old.clone(),
                    new_name: new.clone(),
                })?;
            }
        }
        Ok(())
    }

    /// Drop foreign keys that are removed or changed, every foreign key on a
    /// removed table, and foreign keys into tables whose primary key changes.
    fn drop_foreign_keys(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let pk_changing: HashSet<&str> = matched
            .iter()
            .filter_map(|name| self.pair(name))
            .filter(|(current, wanted)| {
                current.primary_key.is_some() && current.primary_key != wanted.primary_key
            })
            .map(|(current, _)| current.name.as_str())
            .collect();

        let mut ops = Vec::new();
        for table in self.work.tables() {
            let wanted = self.desired.get_table(&table.name);
            for fk in &table.foreign_keys {
                let unchanged = wanted
                    .and_then(|t| t.get_foreign_key(&fk.name))
                    .is_some_and(|d| d == fk);
                if !unchanged || pk_changing.contains(fk.ref_table.as_str()) {
                    ops.push(ChangeOperation::DropForeignKey {
                        table: table.name.clone(),
                        foreign_key: fk.clone(),
                    });
                }
            }
        }
        self.emit_all(ops)
    }

    /// Drop removed or changed indexes. A removed index whose definition
    /// reappears under an unused new name is renamed instead.
    fn drop_indexes(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        let mut claimed: HashSet<&str> = HashSet::new();
        for name in matched {
            let Some((current, wanted)) = self.pair(name) else {
                continue;
            };
            for idx in &current.indexes {
                match wanted.get_index(&idx.name) {
                    Some(same) if same == idx => {}
                    Some(_) => ops.push(drop_index(name, idx)),
                    None => {
                        let renamed = wanted.indexes.iter().find(|candidate| {
                            candidate.same_shape(idx)
                                && self.work.table_for_index(&candidate.name).is_none()
                                && !claimed.contains(candidate.name.as_str())
                        });
                        match renamed {
                            Some(target) => {
                                claimed.insert(target.name.as_str());
                                ops.push(ChangeOperation::RenameIndex {
                                    table: name.clone(),
                                    name: idx.name.clone(),
                                    new_name: target.name.clone(),
                                });
                            }
                            None => ops.push(drop_index(name, idx)),
                        }
                    }
                }
            }
        }
        self.emit_all(ops)
    }

    fn drop_primary_keys(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        for name in matched {
            if let Some((current, wanted)) = self.pair(name)
                && let Some(pk) = &current.primary_key
                && wanted.primary_key.as_ref() != Some(pk)
            {
                ops.push(ChangeOperation::DropPrimaryKey {
                    table: name.clone(),
                    primary_key: pk.clone(),
                });
            }
        }
        self.emit_all(ops)
    }

    fn drop_tables(&mut self, removed: &[String]) -> Result<(), SchemaError> {
        let ops: Vec<ChangeOperation> = removed
            .iter()
            .filter_map(|name| self.work.get_table(name))
            .map(|table| ChangeOperation::DropTable(table.to_def()))
            .collect();
        self.emit_all(ops)
    }

    /// Drop removed columns. When every column of a table goes, the last drop
    /// is returned so it can run after the new columns are added.
    fn drop_columns(&mut self, matched: &[String]) -> Result<Vec<ChangeOperation>, SchemaError> {
        let mut ops = Vec::new();
        let mut held_back = Vec::new();
        for name in matched {
            let Some((current, wanted)) = self.pair(name) else {
                continue;
            };
            let mut drops: Vec<ChangeOperation> = current
                .columns
                .iter()
                .filter(|c| !wanted.has_column(&c.name))
                .map(|c| ChangeOperation::DropColumn {
                    table: name.clone(),
                    column: c.clone(),
                })
                .collect();
            if !drops.is_empty() && drops.len() == current.columns.len() {
                held_back.extend(drops.pop());
            }
            ops.extend(drops);
        }
        self.emit_all(ops)?;
        Ok(held_back)
    }

    fn alter_columns(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        for name in matched {
            let Some((current, wanted)) = self.pair(name) else {
                continue;
            };
            for column in &current.columns {
                if let Some(target) = wanted.get_column(&column.name)
                    && target != column
                {
                    ops.push(ChangeOperation::AlterColumn {
                        table: name.clone(),
                        from: column.clone(),
                        to: target.clone(),
                    });
                }
            }
        }
        self.emit_all(ops)
    }

    fn add_columns(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        for name in matched {
            let Some((current, wanted)) = self.pair(name) else {
                continue;
            };
            for column in &wanted.columns {
                if !current.has_column(&column.name) {
                    ops.push(ChangeOperation::AddColumn {
                        table: name.clone(),
                        column: column.clone(),
                    });
                }
            }
        }
        self.emit_all(ops)
    }

    /// Create new tables. Foreign keys into other new tables, and into tables
    /// whose primary key is only added later, are returned for the final step.
    fn create_tables(
        &mut self,
        created: &[String],
        keys_added: &HashSet<String>,
    ) -> Result<Vec<ChangeOperation>, SchemaError> {
        let new_tables: HashSet<&str> = created.iter().map(String::as_str).collect();
        let mut ops = Vec::new();
        let mut deferred = Vec::new();
        for name in created {
            let Some(wanted) = self.desired.get_table(name) else {
                continue;
            };
            let mut def = wanted.to_def();
            let (inline, later): (Vec<_>, Vec<_>) = std::mem::take(&mut def.foreign_keys)
                .into_iter()
                .partition(|fk| {
                    fk.ref_table == *name
                        || !(new_tables.contains(fk.ref_table.as_str())
                            || keys_added.contains(&fk.ref_table))
                });
            def.foreign_keys = inline;
            deferred.extend(later.into_iter().map(|fk| ChangeOperation::AddForeignKey {
                table: name.clone(),
                foreign_key: fk,
            }));
            ops.push(ChangeOperation::CreateTable(def));
        }
        self.emit_all(ops)?;
        Ok(deferred)
    }

    fn add_primary_keys(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        for name in matched {
            if let Some((current, wanted)) = self.pair(name)
                && let Some(pk) = &wanted.primary_key
                && current.primary_key.as_ref() != Some(pk)
            {
                ops.push(ChangeOperation::AddPrimaryKey {
                    table: name.clone(),
                    primary_key: pk.clone(),
                });
            }
        }
        self.emit_all(ops)
    }

    fn add_indexes(&mut self, matched: &[String]) -> Result<(), SchemaError> {
        let mut ops = Vec::new();
        for name in matched {
            let Some((current, wanted)) = self.pair(name) else {
                continue;
            };
            for idx in &wanted.indexes {
                if current.get_index(&idx.name) != Some(idx) {
                    ops.push(ChangeOperation::AddIndex {
                        table: name.clone(),
                        index: idx.clone(),
                    });
                }
            }
        }
        self.emit_all(ops)
    }

    /// Add foreign keys missing from existing tables, then the ones deferred
    /// from new tables.
    fn add_foreign_keys(&mut self, deferred: Vec<ChangeOperation>) -> Result<(), SchemaError> {
        let deferred_names: HashSet<(String, String)> = deferred
            .iter()
            .filter_map(|op| match op {
                ChangeOperation::AddForeignKey { table, foreign_key } => {
                    Some((table.clone(), foreign_key.name.clone()))
                }
                _ => None,
            })
            .collect();

        let mut ops = Vec::new();
        for wanted in self.desired.tables() {
            let Some(current) = self.work.get_table(&wanted.name) else {
                continue;
            };
            for fk in &wanted.foreign_keys {
                let pending = deferred_names.contains(&(wanted.name.clone(), fk.name.clone()));
                if !pending && current.get_foreign_key(&fk.name) != Some(fk) {
                    ops.push(ChangeOperation::AddForeignKey {
                        table: wanted.name.clone(),
                        foreign_key: fk.clone(),
                    });
                }
            }
        }
        ops.extend(deferred);
        self.emit_all(ops)
    }
}

fn drop_index(table: &str, index: &IndexDef) -> ChangeOperation {
    ChangeOperation::DropIndex {
        table: table.to_string(),
        index: index.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builder::CatalogBuilder;
    use crate::operation::invert_all;

    fn kinds(ops: &[ChangeOperation]) -> Vec<String> {
        ops.iter().map(ChangeOperation::describe).collect()
    }

    /// Diffing must land exactly on `desired`, and the inverse must come back.
    fn assert_converges(current: &Catalog, desired: &Catalog, ops: &[ChangeOperation]) {
        let mut replayed = current.clone();
        catalog::apply_all(&mut replayed, ops).unwrap();
        assert_eq!(&replayed, desired);

        catalog::apply_all(&mut replayed, &invert_all(ops).unwrap()).unwrap();
        assert_eq!(&replayed, current);
    }

    fn parents() -> CatalogBuilder {
        CatalogBuilder::new().table("Parents", |t| {
            t.column("Id", "integer", false)
                .column("Name", "string", true)
                .pk("PK_Parents", &["Id"]);
        })
    }

    #[test]
    fn test_identical_catalogs_produce_nothing() {
        let catalog = parents().build();
        assert!(diff(&catalog, &catalog).unwrap().is_empty());
    }

    #[test]
    fn test_column_order_is_ignored() {
        let current = parents().build();
        let desired = CatalogBuilder::new()
            .table("Parents", |t| {
                t.column("Name", "string", true)
                    .column("Id", "integer", false)
                    .pk("PK_Parents", &["Id"]);
            })
            .build();
        assert!(diff(&current, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_add_classes_and_schedules() {
        let current = parents().build();
        let desired = parents()
            .table("Parents", |t| {
                t.column("Id", "integer", false)
                    .column("Name", "string", true)
                    .column("ApplicationUserId", "string", true)
                    .pk("PK_Parents", &["Id"])
                    .index("IX_Parents_ApplicationUserId", &["ApplicationUserId"], false);
            })
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("ScheduleId", "integer", false)
                    .pk("PK_Classes", &["Id"])
                    .fk("FK_Classes_Schedules_ScheduleId", &["ScheduleId"], "Schedules", &["Id"]);
            })
            .table("Schedules", |t| {
                t.column("Id", "integer", false)
                    .column("ParentId", "integer", false)
                    .pk("PK_Schedules", &["Id"])
                    .fk("FK_Schedules_Parents_ParentId", &["ParentId"], "Parents", &["Id"]);
            })
            .build();

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "add column Parents.ApplicationUserId string",
                "create table Classes",
                "create table Schedules",
                "add index IX_Parents_ApplicationUserId on Parents",
                "add foreign key FK_Classes_Schedules_ScheduleId on Classes referencing Schedules",
            ]
        );
        // The reference to a pre-existing table stays inline.
        let ChangeOperation::CreateTable(schedules) = &ops[2] else {
            panic!("expected create_table");
        };
        assert_eq!(schedules.foreign_keys.len(), 1);
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_drops_come_before_adds() {
        let current = CatalogBuilder::new()
            .table("Branches", |t| {
                t.column("Id", "integer", false).pk("PK_Branches", &["Id"]);
            })
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("BranchId", "integer", false)
                    .column("Room", "string", true)
                    .pk("PK_Classes", &["Id"])
                    .index("IX_Classes_BranchId", &["BranchId"], false)
                    .fk("FK_Classes_Branches_BranchId", &["BranchId"], "Branches", &["Id"]);
            })
            .build();
        let desired = CatalogBuilder::new()
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("Room", "text", false)
                    .column("Capacity", "small_int", true)
                    .pk("PK_Classes", &["Id"]);
            })
            .build();

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "drop foreign key FK_Classes_Branches_BranchId on Classes",
                "drop index IX_Classes_BranchId on Classes",
                "drop table Branches",
                "drop column Classes.BranchId",
                "alter column Classes.Room",
                "add column Classes.Capacity small_int",
            ]
        );
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_rename_hints_keep_data_paths() {
        let current = CatalogBuilder::new()
            .table("Curricula", |t| {
                t.column("Id", "integer", false)
                    .column("Title", "string", true)
                    .pk("PK_Curricula", &["Id"])
                    .index("IX_Curricula_Title", &["Title"], true);
            })
            .build();
        let desired = CatalogBuilder::new()
            .table("Curriculum", |t| {
                t.column("Id", "integer", false)
                    .column("Name", "string", true)
                    .pk("PK_Curricula", &["Id"])
                    .index("IX_Curriculum_Name", &["Name"], true);
            })
            .build();

        let without = diff(&current, &desired).unwrap();
        assert_eq!(without[0].kind(), "drop_table");

        let hints = RenameHints::default()
            .table("Curricula", "Curriculum")
            .column("Curriculum", "Title", "Name");
        let ops = diff_with_renames(&current, &desired, &hints).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "rename table Curricula to Curriculum",
                "rename column Curriculum.Title to Name",
                "rename index IX_Curricula_Title on Curriculum to IX_Curriculum_Name",
            ]
        );
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_new_tables_referencing_each_other() {
        let current = Catalog::new();
        let desired = CatalogBuilder::new()
            .table("Students", |t| {
                t.column("Id", "integer", false)
                    .column("ClassId", "integer", true)
                    .pk("PK_Students", &["Id"])
                    .fk("FK_Students_Classes_ClassId", &["ClassId"], "Classes", &["Id"]);
            })
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("ParentId", "integer", true)
                    .pk("PK_Classes", &["Id"])
                    .fk("FK_Classes_Classes_ParentId", &["ParentId"], "Classes", &["Id"]);
            })
            .build();

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "create table Classes",
                "create table Students",
                "add foreign key FK_Students_Classes_ClassId on Students referencing Classes",
            ]
        );
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_primary_key_change_reroutes_incoming_foreign_keys() {
        let build = |pk: &'static str| {
            CatalogBuilder::new()
                .table("Branches", move |t| {
                    t.column("Id", "integer", false).pk(pk, &["Id"]);
                })
                .table("Classes", |t| {
                    t.column("Id", "integer", false)
                        .column("BranchId", "integer", false)
                        .fk("FK_Classes_Branches_BranchId", &["BranchId"], "Branches", &["Id"]);
                })
                .build()
        };
        let current = build("PK_Branch");
        let desired = build("PK_Branches");

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "drop foreign key FK_Classes_Branches_BranchId on Classes",
                "drop primary key PK_Branch on Branches",
                "add primary key PK_Branches on Branches",
                "add foreign key FK_Classes_Branches_BranchId on Classes referencing Branches",
            ]
        );
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_new_table_waits_for_primary_key_it_references() {
        let current = CatalogBuilder::new()
            .table("Branches", |t| {
                t.column("Id", "integer", false).pk("PK_Branch", &["Id"]);
            })
            .build();
        let desired = CatalogBuilder::new()
            .table("Branches", |t| {
                t.column("Id", "integer", false).pk("PK_Branches", &["Id"]);
            })
            .table("Classes", |t| {
                t.column("Id", "integer", false)
                    .column("BranchId", "integer", false)
                    .fk("FK_Classes_Branches_BranchId", &["BranchId"], "Branches", &["Id"]);
            })
            .build();

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "drop primary key PK_Branch on Branches",
                "create table Classes",
                "add primary key PK_Branches on Branches",
                "add foreign key FK_Classes_Branches_BranchId on Classes referencing Branches",
            ]
        );
        match &ops[1] {
            ChangeOperation::CreateTable(def) => assert!(def.foreign_keys.is_empty()),
            other => panic!("expected create table, got {other:?}"),
        }
        assert_converges(&current, &desired, &ops);
    }

    #[test]
    fn test_replacing_every_column_keeps_table_non_empty() {
        let current = CatalogBuilder::new()
            .table("Logs", |t| {
                t.column("Message", "text", true);
            })
            .build();
        let desired = CatalogBuilder::new()
            .table("Logs", |t| {
                t.column("Body", "text", true);
            })
            .build();

        let ops = diff(&current, &desired).unwrap();
        assert_eq!(
            kinds(&ops),
            vec!["add column Logs.Body text", "drop column Logs.Message"]
        );
        assert_converges(&current, &desired, &ops);
    }
}
