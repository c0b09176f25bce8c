//! Output reporters for different formats
//!
//! Reports go to stdout. Logs go to stderr, so `--format json` output can be
//! piped straight into other tools.

use crate::runner::{RunReport, StatusReport};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub mod json;
pub mod text;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error writing report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn reporter(self) -> Box<dyn Reporter> {
        match self {
            OutputFormat::Text => Box::new(TextReporter),
            OutputFormat::Json => Box::new(JsonReporter::new()),
        }
    }
}

/// Trait for output format reporters.
pub trait Reporter {
    /// Outcome of `up` or `down`.
    fn run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError>;

    fn status(&self, report: &StatusReport, out: &mut dyn Write) -> Result<(), ReportError>;

    /// A migration file written by `create` or `diff`.
    fn created(
        &self,
        path: &Path,
        operations: usize,
        out: &mut dyn Write,
    ) -> Result<(), ReportError>;

    /// Result of `unlock`: the holder that was cleared, if any.
    fn unlocked(&self, previous: Option<&str>, out: &mut dyn Write) -> Result<(), ReportError>;
}

/// Plain text for terminals.
#[derive(Debug, Default)]
pub struct TextReporter;

/// JSON documents, one per command.
#[derive(Debug)]
pub struct JsonReporter {
    pub pretty: bool,
}

impl JsonReporter {
    pub fn new() -> Self {
        Self { pretty: true }
    }
}

impl Default for JsonReporter {
    fn default() -> Self {
        Self::new()
    }
}
