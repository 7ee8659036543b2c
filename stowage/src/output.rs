//! Output formatting for CLI commands.
//!
//! Every command builds a serializable result; text mode renders it through a
//! closure, JSON mode prints it as is.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use stowage_core::Error;

/// Exit status for a failed command.
///
/// 2 means the stored state disagrees with the request (drift, divergence,
/// failed hash checks) and 3 means a delete was declined.
pub fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::NotConfirmed { .. }) => 3,
        Some(e) if e.is_consistency_error() => 2,
        Some(Error::Integrity { .. }) => 2,
        _ => 1,
    }
}

/// Prints command results to stdout and failures to stderr.
pub struct OutputWriter {
    json: bool,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `data` as pretty JSON, or render it with `text`.
    pub fn emit<T: Serialize>(&self, data: &T, text: impl FnOnce() -> String) -> Result<()> {
        let mut stdout = io::stdout().lock();
        if self.json {
            serde_json::to_writer_pretty(&mut stdout, data)?;
            writeln!(stdout)?;
        } else {
            stdout.write_all(text().as_bytes())?;
        }
        stdout.flush()?;
        Ok(())
    }

    /// Report `error` on stderr and return the process exit status.
    pub fn fail(&self, error: &anyhow::Error) -> u8 {
        let status = exit_status(error);
        let mut stderr = io::stderr().lock();
        if self.json {
            let report = ErrorOutput {
                success: false,
                status,
                error: format!("{:#}", error),
            };
            if serde_json::to_writer_pretty(&mut stderr, &report).is_ok() {
                let _ = writeln!(stderr);
            }
        } else {
            let _ = writeln!(stderr, "stowage: {:#}", error);
        }
        status
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub status: u8,
    pub error: String,
}

/// One entity found by `walk`.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WalkOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: Vec<EntryInfo>,
}

#[derive(Debug, Serialize)]
pub struct ShowOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub info: serde_json::Value,
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct CheckOutput {
    pub success: bool,
    pub result_code: u8,
    pub name: String,
    pub forced: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadOutput {
    pub success: bool,
    pub result_code: u8,
    pub rows: usize,
    pub columns: Vec<String>,
    /// Rendered table, as printed in text mode.
    pub preview: String,
}

#[derive(Debug, Serialize)]
pub struct ExistsOutput {
    pub success: bool,
    pub result_code: u8,
    pub exists: bool,
}

#[derive(Debug, Serialize)]
pub struct RmOutput {
    pub success: bool,
    pub result_code: u8,
    pub name: String,
    /// Set when only table partitions were removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,
}
