//! Stdout protocol between a worker driver and the executor.
//!
//! After running the generated code a driver prints exactly one of:
//! - `CADFORGE_RESULT_MISSING <binding>` and exits with [`MISSING_RESULT_EXIT`]
//! - `CADFORGE_RESULT_OK`, followed by one line per requested format, either
//!   `<format>:<path>` or `CADFORGE_EXPORT_FAILED <format>: <message>`
//!
//! Anything printed before the marker (the generated code's own output) and
//! anything on stderr is diagnostic only.

use cadforge_common::{ExportFormat, FormatFailure};
use std::path::PathBuf;

pub const RESULT_OK_MARKER: &str = "CADFORGE_RESULT_OK";
pub const RESULT_MISSING_MARKER: &str = "CADFORGE_RESULT_MISSING";
pub const EXPORT_FAILED_MARKER: &str = "CADFORGE_EXPORT_FAILED";
pub const MISSING_RESULT_EXIT: i32 = 3;

/// What a worker said on stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub result_ok: bool,
    pub result_missing: bool,
    pub exported: Vec<(ExportFormat, PathBuf)>,
    pub failures: Vec<FormatFailure>,
}

impl WorkerReport {
    pub fn parse(stdout: &str) -> Self {
        let mut report = WorkerReport::default();

        for line in stdout.lines().map(str::trim) {
            if line == RESULT_OK_MARKER {
                report.result_ok = true;
                continue;
            }
            if line.starts_with(RESULT_MISSING_MARKER) {
                report.result_missing = true;
                continue;
            }
            if !report.result_ok {
                continue;
            }
            if let Some(rest) = line.strip_prefix(EXPORT_FAILED_MARKER) {
                if let Some((fmt, message)) = rest.trim().split_once(':')
                    && let Ok(format) = fmt.trim().parse::<ExportFormat>()
                {
                    report.failures.push(FormatFailure {
                        format,
                        message: message.trim().to_string(),
                    });
                }
                continue;
            }
            if let Some((fmt, path)) = line.split_once(':')
                && let Ok(format) = fmt.parse::<ExportFormat>()
                && !path.trim().is_empty()
            {
                report.exported.push((format, PathBuf::from(path.trim())));
            }
        }

        report
    }

    pub fn exported_path(&self, format: ExportFormat) -> Option<&PathBuf> {
        self.exported
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, p)| p)
    }

    pub fn failure_for(&self, format: ExportFormat) -> Option<&FormatFailure> {
        self.failures.iter().find(|f| f.format == format)
    }
}
