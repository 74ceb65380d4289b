use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::unit::UnitTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    OverallModel,
    Part,
}

impl From<UnitTarget> for UnitType {
    fn from(target: UnitTarget) -> Self {
        match target {
            UnitTarget::OverallModel => Self::OverallModel,
            UnitTarget::Part { .. } => Self::Part,
        }
    }
}

/// Human judgement of a generated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Good,
    Ok,
    Bad,
    Corrected,
    Failure,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Ok => "ok",
            Self::Bad => "bad",
            Self::Corrected => "corrected",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Self::Good),
            "ok" => Ok(Self::Ok),
            "bad" => Ok(Self::Bad),
            "corrected" => Ok(Self::Corrected),
            "failure" => Ok(Self::Failure),
            _ => Err(format!("Invalid rating: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    /// The generated code was wrong and a human fixed it.
    CodeFix,
    /// The code ran but the model should produce something better.
    ModelImprovement,
}

impl FromStr for CorrectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_fix" => Ok(Self::CodeFix),
            "model_improvement" => Ok(Self::ModelImprovement),
            _ => Err(format!("Invalid correction type: {}", s)),
        }
    }
}

/// One line of the append-only feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    pub user_id: String,
    pub unit_type: UnitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<u32>,
    pub unit_id: String,
    pub prompt: String,
    pub generated_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    /// Outcome kind of the unit the entry refers to.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_type: Option<CorrectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_text: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub validated: bool,
}

impl FeedbackEntry {
    pub fn new(
        project_id: Uuid,
        user_id: &str,
        target: UnitTarget,
        unit_id: &str,
        prompt: &str,
        generated_code: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            project_id,
            user_id: user_id.to_string(),
            unit_type: target.into(),
            part_number: target.part_number(),
            unit_id: unit_id.to_string(),
            prompt: prompt.to_string(),
            generated_code: generated_code.to_string(),
            rating: None,
            outcome: String::new(),
            error_message: None,
            corrected_code: None,
            correction_type: None,
            feedback_text: None,
            success: false,
            validated: false,
        }
    }
}
