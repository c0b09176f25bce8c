//! Migration runner
//!
//! A run goes through `Planning` and `Executing` and ends in one of the
//! terminal [`RunState`]s. Planning holds the advisory lock, checks the ledger
//! against the local migrations, rebuilds the schema catalog by replaying the
//! applied migrations and dry-runs every pending operation on it. Nothing
//! touches the schema until the whole run has rendered cleanly.
//!
//! Executing runs one migration at a time. A transactional migration and its
//! ledger write commit together; on failure that migration is rolled back and
//! the run halts. Migrations committed earlier in the run stay committed.

use crate::catalog::{self, Catalog};
use crate::dialect::{Dialect, RenderError};
use crate::driver::{Database, DbError};
use crate::history::{AppliedMigration, MigrationHistory};
use crate::input::MigrationSet;
use crate::lock::{DEFAULT_LOCK_TABLE, LockError, MigrationLock};
use crate::migration::Migration;
use crate::operation::ChangeOperation;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, error, info, warn};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    Planning,
    Executing,
    /// Every pending migration committed, or there was nothing to do.
    Committed,
    /// The first migration of the run failed and was rolled back.
    RolledBack,
    /// Halted after some migrations had already committed.
    Failed,
    /// Stopped at a migration boundary on request.
    Cancelled,
}

/// How far `down` reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownTarget {
    /// Revert the most recent `n` applied migrations.
    Steps(usize),
    /// Revert everything applied after this id. The target itself stays applied.
    To(String),
    All,
}

impl Default for DownTarget {
    fn default() -> Self {
        DownTarget::Steps(1)
    }
}

/// Cooperative cancellation, observed between migrations only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "migration `{id}` changed after it was applied (recorded checksum {recorded}, local {local})"
    )]
    ChecksumMismatch {
        id: String,
        recorded: String,
        local: String,
    },

    #[error(
        "migration `{id}` is pending but the later `{latest}` is already applied; use --allow-out-of-order to apply it anyway"
    )]
    OutOfOrder { id: String, latest: String },

    #[error("migration `{id}` is recorded as applied but has no local migration file")]
    MissingMigration { id: String },

    #[error("unknown target migration `{id}`")]
    UnknownTarget { id: String },

    #[error("migration lock is held by {holder}; if that process is gone, run `migrate unlock`")]
    LockHeld { holder: String },

    #[error(
        "migration `{migration_id}` is invalid at operation {operation_index} ({operation}): {source}"
    )]
    Plan {
        migration_id: String,
        operation_index: usize,
        operation: String,
        #[source]
        source: RenderError,
    },

    #[error(
        "migration `{migration_id}` failed at operation {operation_index} ({operation}): {source}"
    )]
    OperationExecution {
        migration_id: String,
        operation_index: usize,
        operation: String,
        #[source]
        source: DbError,
    },

    #[error("database error: {0}")]
    Database(#[from] DbError),
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { holder } => RunError::LockHeld { holder },
            LockError::Database(e) => RunError::Database(e),
        }
    }
}

impl RunError {
    /// Process exit code: 2 for a bad invocation, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::UnknownTarget { .. } => 2,
            _ => 1,
        }
    }

    fn plan(migration: &Migration, index: usize, op: &ChangeOperation, source: RenderError) -> Self {
        RunError::Plan {
            migration_id: migration.id.clone(),
            operation_index: index,
            operation: op.describe(),
            source,
        }
    }
}

/// Where and why execution stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub migration_id: String,
    /// `None` when the failure was in the ledger write or the commit.
    pub operation_index: Option<usize>,
    pub operation: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    pub state: RunState,
    /// Migrations planned for this run, in execution order.
    pub planned: Vec<String>,
    /// Migrations committed by this run, in execution order.
    pub completed: Vec<String>,
    pub failure: Option<RunFailure>,
    /// Operations in the plan that can lose data, as `<id>: <operation>`.
    pub data_loss: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.state, RunState::Committed)
    }

    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Committed => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
    /// Applied ids with no local migration.
    pub unknown: Vec<String>,
    pub checksum_mismatches: Vec<String>,
}

impl StatusReport {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.checksum_mismatches.is_empty()
    }
}

/// One migration of a plan, with the SQL rendered for each of its operations.
#[derive(Debug)]
pub struct PlannedMigration<'m> {
    pub migration: &'m Migration,
    pub statements: Vec<Vec<String>>,
}

impl PlannedMigration<'_> {
    pub fn operations(&self, direction: Direction) -> &[ChangeOperation] {
        match direction {
            Direction::Up => self.migration.up(),
            Direction::Down => self.migration.down(),
        }
    }
}

#[derive(Debug)]
pub struct Plan<'m> {
    pub direction: Direction,
    pub steps: Vec<PlannedMigration<'m>>,
    /// Schema after the whole plan has run.
    pub catalog: Catalog,
    pub data_loss: Vec<String>,
}

impl Plan<'_> {
    pub fn ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.migration.id.clone()).collect()
    }
}

/// Which migrations to run, before validation.
enum Selection<'a> {
    Up { to: Option<&'a str> },
    Down(&'a DownTarget),
}

pub struct MigrationRunner {
    migrations: MigrationSet,
    history: MigrationHistory,
    lock_table: String,
    allow_out_of_order: bool,
    cancel: CancellationToken,
}

impl MigrationRunner {
    pub fn new(migrations: MigrationSet) -> Self {
        Self {
            migrations,
            history: MigrationHistory::default(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            allow_out_of_order: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn history_table(mut self, table: impl Into<String>) -> Self {
        self.history = MigrationHistory::new(table);
        self
    }

    pub fn lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    pub fn allow_out_of_order(mut self, allow: bool) -> Self {
        self.allow_out_of_order = allow;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    /// Schema produced by every local migration, as `migrate diff` compares against.
    pub fn local_catalog(&self) -> Result<Catalog, RunError> {
        let all: Vec<&Migration> = self.migrations.migrations().iter().collect();
        replay(&all)
    }

    /// Apply pending migrations in id order, up to and including `to`.
    pub fn up(&self, db: &mut dyn Database, to: Option<&str>) -> Result<RunReport, RunError> {
        self.run(db, Selection::Up { to })
    }

    /// Revert applied migrations, newest first.
    pub fn down(&self, db: &mut dyn Database, target: &DownTarget) -> Result<RunReport, RunError> {
        self.run(db, Selection::Down(target))
    }

    /// Compare the ledger with the local migrations. Never takes the lock and
    /// never creates the ledger.
    pub fn status(&self, db: &mut dyn Database) -> Result<StatusReport, RunError> {
        let applied = self.history.list_applied(db)?;
        let applied_ids: HashSet<&str> = applied.iter().map(|a| a.id.as_str()).collect();

        let mut report = StatusReport::default();
        for row in &applied {
            match self.migrations.get(&row.id) {
                None => report.unknown.push(row.id.clone()),
                Some(m) if m.checksum() != row.checksum => {
                    report.checksum_mismatches.push(row.id.clone())
                }
                Some(_) => {}
            }
        }
        report.pending = self
            .migrations
            .ids()
            .filter(|id| !applied_ids.contains(id))
            .map(str::to_string)
            .collect();
        report.applied = applied;
        Ok(report)
    }

    fn run(&self, db: &mut dyn Database, selection: Selection<'_>) -> Result<RunReport, RunError> {
        let lock = MigrationLock::new(&self.lock_table);
        lock.acquire(db)?;
        debug!(holder = lock.holder(), "holding migration lock");

        let result = self.plan_and_execute(db, selection);

        if let Err(e) = lock.release(db) {
            error!("failed to release migration lock: {e}");
            if result.is_ok() {
                return Err(e.into());
            }
        }
        result
    }

    fn plan_and_execute(
        &self,
        db: &mut dyn Database,
        selection: Selection<'_>,
    ) -> Result<RunReport, RunError> {
        debug!(state = %RunState::Planning, "run state");
        self.history.ensure_table(db)?;
        let applied = self.history.list_applied(db)?;
        let plan = self.plan(db.dialect(), &applied, selection)?;

        for loss in &plan.data_loss {
            warn!("possible data loss: {loss}");
        }

        let mut report = RunReport {
            direction: plan.direction,
            state: RunState::Committed,
            planned: plan.ids(),
            completed: Vec::new(),
            failure: None,
            data_loss: plan.data_loss.clone(),
        };
        if plan.steps.is_empty() {
            info!("{}: nothing to do", plan.direction);
            return Ok(report);
        }

        debug!(state = %RunState::Executing, "run state");
        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                warn!(
                    "cancelled before {}; {} migration(s) completed",
                    step.migration.id,
                    report.completed.len()
                );
                report.state = RunState::Cancelled;
                return Ok(report);
            }

            match self.execute(db, step, plan.direction) {
                Ok(()) => report.completed.push(step.migration.id.clone()),
                Err(failure) => {
                    error!(
                        "migration {} failed: {}",
                        failure.migration_id, failure.error
                    );
                    report.state = if report.completed.is_empty() && step.migration.run_in_transaction
                    {
                        RunState::RolledBack
                    } else {
                        RunState::Failed
                    };
                    report.failure = Some(failure);
                    return Ok(report);
                }
            }
        }

        info!(
            "{} complete: {} migration(s)",
            plan.direction,
            report.completed.len()
        );
        Ok(report)
    }

    /// Validate and render a run without touching the database.
    fn plan<'m>(
        &'m self,
        dialect: &dyn Dialect,
        applied: &[AppliedMigration],
        selection: Selection<'_>,
    ) -> Result<Plan<'m>, RunError> {
        for row in applied {
            let Some(local) = self.migrations.get(&row.id) else {
                return Err(RunError::MissingMigration { id: row.id.clone() });
            };
            if local.checksum() != row.checksum {
                return Err(RunError::ChecksumMismatch {
                    id: row.id.clone(),
                    recorded: row.checksum.clone(),
                    local: local.checksum().to_string(),
                });
            }
        }

        let applied_ids: HashSet<&str> = applied.iter().map(|a| a.id.as_str()).collect();
        let applied_migrations: Vec<&Migration> = self
            .migrations
            .migrations()
            .iter()
            .filter(|m| applied_ids.contains(m.id.as_str()))
            .collect();

        let (direction, pending) = match selection {
            Selection::Up { to } => (Direction::Up, self.pending_up(&applied_migrations, to)?),
            Selection::Down(target) => (
                Direction::Down,
                self.pending_down(&applied_migrations, target)?,
            ),
        };

        let catalog = replay(&applied_migrations)?;
        dry_run(dialect, catalog, direction, pending)
    }

    fn pending_up<'m>(
        &'m self,
        applied: &[&'m Migration],
        to: Option<&str>,
    ) -> Result<Vec<&'m Migration>, RunError> {
        if let Some(id) = to
            && !self.migrations.contains(id)
        {
            return Err(RunError::UnknownTarget { id: id.to_string() });
        }

        let applied_ids: HashSet<&str> = applied.iter().map(|m| m.id.as_str()).collect();
        let pending: Vec<&Migration> = self
            .migrations
            .migrations()
            .iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()))
            .filter(|m| to.is_none_or(|to| m.id.as_str() <= to))
            .collect();

        if let Some(latest) = applied.last() {
            let late = pending.iter().find(|m| m.id < latest.id);
            if let Some(m) = late {
                if !self.allow_out_of_order {
                    return Err(RunError::OutOfOrder {
                        id: m.id.clone(),
                        latest: latest.id.clone(),
                    });
                }
                warn!("applying {} out of order (latest applied is {})", m.id, latest.id);
            }
        }
        Ok(pending)
    }

    fn pending_down<'m>(
        &'m self,
        applied: &[&'m Migration],
        target: &DownTarget,
    ) -> Result<Vec<&'m Migration>, RunError> {
        let newest_first = applied.iter().rev().copied();
        Ok(match target {
            DownTarget::Steps(n) => newest_first.take(*n).collect(),
            DownTarget::All => newest_first.collect(),
            DownTarget::To(id) => {
                if !self.migrations.contains(id) {
                    return Err(RunError::UnknownTarget { id: id.clone() });
                }
                newest_first.filter(|m| m.id > *id).collect()
            }
        })
    }

    /// Execute one planned migration. The ledger row is written in the same
    /// transaction as the DDL.
    fn execute(
        &self,
        db: &mut dyn Database,
        step: &PlannedMigration<'_>,
        direction: Direction,
    ) -> Result<(), RunFailure> {
        let migration = step.migration;
        let transactional = migration.run_in_transaction;
        info!("{direction} {}", migration.id);

        let fail = |index: Option<usize>, error: String| RunFailure {
            migration_id: migration.id.clone(),
            operation_index: index,
            operation: index.map(|i| step.operations(direction)[i].describe()),
            error,
        };

        if transactional {
            db.begin().map_err(|e| fail(None, e.to_string()))?;
        } else {
            debug!(id = %migration.id, "running without a transaction");
        }

        let mut result = self.execute_statements(db, step, direction);
        if result.is_ok() {
            let ledger = match direction {
                Direction::Up => self
                    .history
                    .record_applied(db, &migration.id, migration.checksum()),
                Direction::Down => self.history.record_reverted(db, &migration.id),
            };
            result = ledger.map_err(RunError::Database);
        }
        if result.is_ok() && transactional {
            result = db.commit().map_err(RunError::Database);
        }
        let Err(err) = result else {
            return Ok(());
        };

        if transactional {
            match db.rollback() {
                Ok(()) => warn!("rolled back {}", migration.id),
                Err(e) => error!("rollback of {} failed: {e}", migration.id),
            }
        } else {
            warn!(
                "{} ran without a transaction; statements before the failure were not rolled back",
                migration.id
            );
        }
        Err(match err {
            RunError::OperationExecution {
                operation_index,
                source,
                ..
            } => fail(Some(operation_index), source.to_string()),
            other => fail(None, other.to_string()),
        })
    }

    fn execute_statements(
        &self,
        db: &mut dyn Database,
        step: &PlannedMigration<'_>,
        direction: Direction,
    ) -> Result<(), RunError> {
        let ops = step.operations(direction);
        for (index, (op, statements)) in ops.iter().zip(&step.statements).enumerate() {
            debug!(id = %step.migration.id, index, "{op}");
            for sql in statements {
                db.execute(sql)
                    .map_err(|source| RunError::OperationExecution {
                        migration_id: step.migration.id.clone(),
                        operation_index: index,
                        operation: op.describe(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// SQL a run would execute, including ledger writes, without a database.
    ///
    /// `from` is the last migration assumed applied (none when absent; for
    /// `down` it defaults to the newest local migration). `to` bounds the run
    /// the same way `up --to` and `down --to` do.
    pub fn script(
        &self,
        dialect: &dyn Dialect,
        direction: Direction,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<String, RunError> {
        for id in from.iter().chain(to.iter()) {
            if !self.migrations.contains(id) {
                return Err(RunError::UnknownTarget { id: id.to_string() });
            }
        }

        let head = match (direction, from) {
            (_, Some(id)) => Some(id),
            (Direction::Down, None) => self.migrations.migrations().last().map(|m| m.id.as_str()),
            (Direction::Up, None) => None,
        };
        let applied: Vec<&Migration> = self
            .migrations
            .migrations()
            .iter()
            .filter(|m| head.is_some_and(|head| m.id.as_str() <= head))
            .collect();

        let pending = match direction {
            Direction::Up => self.pending_up(&applied, to)?,
            Direction::Down => {
                let target = match to {
                    Some(id) => DownTarget::To(id.to_string()),
                    None => DownTarget::All,
                };
                self.pending_down(&applied, &target)?
            }
        };
        let plan = dry_run(dialect, replay(&applied)?, direction, pending)?;

        let mut out = format!(
            "-- {} {} migration(s) for {}\n",
            direction,
            plan.steps.len(),
            dialect.kind()
        );
        if direction == Direction::Up {
            out.push_str(&self.history.create_table_sql(dialect));
            out.push_str(";\n");
        }
        for step in &plan.steps {
            let migration = step.migration;
            out.push_str(&format!("\n-- {}\n", migration.id));
            for loss in Migration::data_loss(step.operations(direction)) {
                out.push_str(&format!("-- WARNING: possible data loss: {loss}\n"));
            }
            if migration.run_in_transaction {
                out.push_str("BEGIN;\n");
            }
            for sql in step.statements.iter().flatten() {
                out.push_str(sql);
                out.push_str(";\n");
            }
            let ledger = match direction {
                Direction::Up => {
                    self.history
                        .insert_sql(dialect, &migration.id, migration.checksum(), None)
                }
                Direction::Down => self.history.delete_sql(dialect, &migration.id),
            };
            out.push_str(&ledger);
            out.push_str(";\n");
            if migration.run_in_transaction {
                out.push_str("COMMIT;\n");
            }
        }
        Ok(out)
    }
}

/// Schema produced by the applied migrations, replayed in id order.
fn replay(applied: &[&Migration]) -> Result<Catalog, RunError> {
    let mut catalog = Catalog::new();
    for migration in applied {
        catalog::apply_all(&mut catalog, migration.up()).map_err(|(index, e)| {
            RunError::plan(migration, index, &migration.up()[index], e.into())
        })?;
    }
    debug!(tables = catalog.len(), "replayed applied migrations");
    Ok(catalog)
}

/// Render and replay every pending operation on `catalog`, in order.
fn dry_run<'m>(
    dialect: &dyn Dialect,
    mut catalog: Catalog,
    direction: Direction,
    pending: Vec<&'m Migration>,
) -> Result<Plan<'m>, RunError> {
    let mut steps = Vec::with_capacity(pending.len());
    let mut data_loss = Vec::new();
    for migration in pending {
        let ops = match direction {
            Direction::Up => migration.up(),
            Direction::Down => migration.down(),
        };
        let mut statements = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            let sql = dialect
                .render(op, &catalog)
                .map_err(|e| RunError::plan(migration, index, op, e))?;
            catalog::apply(&mut catalog, op)
                .map_err(|e| RunError::plan(migration, index, op, e.into()))?;
            statements.push(sql);
        }
        data_loss.extend(
            Migration::data_loss(ops)
                .into_iter()
                .map(|loss| format!("{}: {loss}", migration.id)),
        );
        steps.push(PlannedMigration {
            migration,
            statements,
        });
    }
    Ok(Plan {
        direction,
        steps,
        catalog,
        data_loss,
    })
}
