use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Interchange formats the executor can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Step,
    Stl,
    Dxf,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Stl => "stl",
            Self::Dxf => "dxf",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "step" | "stp" => Ok(Self::Step),
            "stl" => Ok(Self::Stl),
            "dxf" => Ok(Self::Dxf),
            _ => Err(format!("Invalid export format: {}", s)),
        }
    }
}

/// What a unit was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitTarget {
    OverallModel,
    Part { number: u32 },
}

impl UnitTarget {
    pub fn part_number(&self) -> Option<u32> {
        match self {
            Self::OverallModel => None,
            Self::Part { number } => Some(*number),
        }
    }
}

impl fmt::Display for UnitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverallModel => f.write_str("overall_model"),
            Self::Part { number } => write!(f, "part {}", number),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOrigin {
    #[default]
    Generated,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub format: ExportFormat,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatFailure {
    pub format: ExportFormat,
    pub message: String,
}

/// Classification of one execution attempt.
///
/// Only `Success` and `PartialExport` carry files. The remaining variants are
/// generation-quality failures, not infrastructure errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitOutcome {
    Success,
    PartialExport { failed: Vec<FormatFailure> },
    MissingResult { binding: String },
    RuntimeFault { message: String },
    Timeout { limit_secs: u64 },
}

impl UnitOutcome {
    /// True when at least one requested format was exported.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::PartialExport { .. })
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialExport { .. } => "partial_export",
            Self::MissingResult { .. } => "missing_result",
            Self::RuntimeFault { .. } => "runtime_fault",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Outcomes whose source/result pair is kept as retraining signal.
    pub fn is_feedback_worthy(&self) -> bool {
        !matches!(self, Self::Success)
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Success => "success".to_string(),
            Self::PartialExport { failed } => {
                let formats: Vec<&str> = failed.iter().map(|f| f.format.as_str()).collect();
                format!("partial export, failed: {}", formats.join(", "))
            }
            Self::MissingResult { binding } => {
                format!("code ran but never bound `{}`", binding)
            }
            Self::RuntimeFault { message } => format!("runtime fault: {}", message),
            Self::Timeout { limit_secs } => format!("timed out after {}s", limit_secs),
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Persisted record of one generation+execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedUnit {
    pub unit_id: String,
    pub project_id: Uuid,
    pub target: UnitTarget,
    pub attempt: u32,
    #[serde(default)]
    pub origin: UnitOrigin,
    pub source: String,
    #[serde(default)]
    pub description: String,
    pub formats: Vec<ExportFormat>,
    pub outcome: UnitOutcome,
    #[serde(default)]
    pub files: Vec<ExportedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Driver script kept on disk after a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl GeneratedUnit {
    pub fn file_for(&self, format: ExportFormat) -> Option<&ExportedFile> {
        self.files.iter().find(|f| f.format == format)
    }
}
