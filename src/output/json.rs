//! JSON output reporter
//!
//! Run and status reports are serialized as they are; `create`, `diff` and
//! `unlock` produce small single-object documents.

use crate::output::{JsonReporter, ReportError, Reporter};
use crate::runner::{RunReport, StatusReport};
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::Path;

impl JsonReporter {
    fn write<T: Serialize + ?Sized>(&self, value: &T, out: &mut dyn Write) -> Result<(), ReportError> {
        let result = if self.pretty {
            serde_json::to_writer_pretty(&mut *out, value)
        } else {
            serde_json::to_writer(&mut *out, value)
        };
        result.map_err(|e| ReportError::Serialization(e.to_string()))?;
        writeln!(out)?;
        Ok(())
    }
}

impl Reporter for JsonReporter {
    fn run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError> {
        self.write(report, out)
    }

    fn status(&self, report: &StatusReport, out: &mut dyn Write) -> Result<(), ReportError> {
        self.write(report, out)
    }

    fn created(
        &self,
        path: &Path,
        operations: usize,
        out: &mut dyn Write,
    ) -> Result<(), ReportError> {
        self.write(
            &json!({
                "created": path.to_string_lossy().replace('\\', "/"),
                "operations": operations,
            }),
            out,
        )
    }

    fn unlocked(&self, previous: Option<&str>, out: &mut dyn Write) -> Result<(), ReportError> {
        self.write(
            &json!({
                "released": previous.is_some(),
                "previous_holder": previous,
            }),
            out,
        )
    }
}
