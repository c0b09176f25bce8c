//! Human-readable text output reporter
//!
//! ```text
//! applied 20240101000000_InitialCreate
//! FAILED 20240102000000_AddClasses at operation 1 (drop column Parents.Email)
//!   sqlite: no such column: Email
//! up: 1 of 2 migration(s) applied, state failed
//! ```

use crate::output::{ReportError, Reporter, TextReporter};
use crate::runner::{Direction, RunReport, StatusReport};
use std::io::Write;
use std::path::Path;

impl Reporter for TextReporter {
    fn run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError> {
        let verb = match report.direction {
            Direction::Up => "applied",
            Direction::Down => "reverted",
        };

        for loss in &report.data_loss {
            writeln!(out, "data loss: {loss}")?;
        }
        for id in &report.completed {
            writeln!(out, "{verb} {id}")?;
        }
        if let Some(failure) = &report.failure {
            match (failure.operation_index, &failure.operation) {
                (Some(index), Some(operation)) => writeln!(
                    out,
                    "FAILED {} at operation {index} ({operation})",
                    failure.migration_id
                )?,
                _ => writeln!(out, "FAILED {}", failure.migration_id)?,
            }
            writeln!(out, "  {}", failure.error)?;
        }

        if report.planned.is_empty() {
            writeln!(out, "{}: nothing to do", report.direction)?;
        } else {
            writeln!(
                out,
                "{}: {} of {} migration(s) {verb}, state {}",
                report.direction,
                report.completed.len(),
                report.planned.len(),
                report.state
            )?;
        }
        Ok(())
    }

    fn status(&self, report: &StatusReport, out: &mut dyn Write) -> Result<(), ReportError> {
        for applied in &report.applied {
            let marker = if report.checksum_mismatches.contains(&applied.id) {
                "changed"
            } else if report.unknown.contains(&applied.id) {
                "unknown"
            } else {
                "applied"
            };
            writeln!(out, "{marker:<8} {}  {}", applied.id, applied.applied_at)?;
        }
        for id in &report.pending {
            writeln!(out, "{:<8} {id}", "pending")?;
        }
        writeln!(
            out,
            "{} applied, {} pending",
            report.applied.len(),
            report.pending.len()
        )?;
        if !report.checksum_mismatches.is_empty() {
            writeln!(
                out,
                "{} migration(s) changed after they were applied",
                report.checksum_mismatches.len()
            )?;
        }
        if !report.unknown.is_empty() {
            writeln!(
                out,
                "{} applied migration(s) have no local file",
                report.unknown.len()
            )?;
        }
        Ok(())
    }

    fn created(
        &self,
        path: &Path,
        operations: usize,
        out: &mut dyn Write,
    ) -> Result<(), ReportError> {
        let file = path.to_string_lossy().replace('\\', "/");
        writeln!(out, "created {file} ({operations} operation(s))")?;
        Ok(())
    }

    fn unlocked(&self, previous: Option<&str>, out: &mut dyn Write) -> Result<(), ReportError> {
        match previous {
            Some(holder) => writeln!(out, "released lock held by {holder}")?,
            None => writeln!(out, "lock was not held")?,
        }
        Ok(())
    }
}
