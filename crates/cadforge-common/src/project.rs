use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five ordered phases of a design project's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Concept,
    OverallModel,
    Parts,
    Generation,
    Completed,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Concept,
        Stage::OverallModel,
        Stage::Parts,
        Stage::Generation,
        Stage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::OverallModel => "overall_model",
            Self::Parts => "parts",
            Self::Generation => "generation",
            Self::Completed => "completed",
        }
    }

    /// The stage that follows this one, or `None` for `Completed`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Concept => Some(Self::OverallModel),
            Self::OverallModel => Some(Self::Parts),
            Self::Parts => Some(Self::Generation),
            Self::Generation => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Only single forward steps are legal; skips and regressions are not.
    pub fn can_transition_to(self, to: Stage) -> bool {
        self.next() == Some(to)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concept" => Ok(Self::Concept),
            "overall_model" => Ok(Self::OverallModel),
            "parts" => Ok(Self::Parts),
            "generation" => Ok(Self::Generation),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Progress within the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Approved,
    Generating,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Record of one explicit approval that moved the project forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageApproval {
    pub from: Stage,
    pub to: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// One user request, tracked from concept to exported parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignProject {
    pub id: Uuid,
    pub user_id: String,
    pub original_prompt: String,
    pub stage: Stage,
    pub status: ProjectStatus,
    pub total_parts: u32,
    pub generated_parts: u32,
    pub failed_parts: u32,
    /// Unit id of the latest whole-object attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_unit_id: Option<String>,
    #[serde(default)]
    pub approvals: Vec<StageApproval>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DesignProject {
    pub fn new(user_id: &str, original_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            original_prompt: original_prompt.to_string(),
            stage: Stage::Concept,
            status: ProjectStatus::Pending,
            total_parts: 0,
            generated_parts: 0,
            failed_parts: 0,
            overall_unit_id: None,
            approvals: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Parts that reached a terminal outcome, successful or not.
    pub fn settled_parts(&self) -> u32 {
        self.generated_parts + self.failed_parts
    }

    pub fn all_parts_settled(&self) -> bool {
        self.total_parts > 0 && self.settled_parts() == self.total_parts
    }

    /// Short, filesystem-friendly prefix used in unit ids.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Design classification produced by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DesignType {
    GeometricPrimitive,
    MechanicalSystem,
    Enclosure,
    Structural,
    Other(String),
}

impl DesignType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GeometricPrimitive => "geometric_primitive",
            Self::MechanicalSystem => "mechanical_system",
            Self::Enclosure => "enclosure",
            Self::Structural => "structural",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for DesignType {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "geometric_primitive" => Self::GeometricPrimitive,
            "mechanical_system" => Self::MechanicalSystem,
            "enclosure" => Self::Enclosure,
            "structural" => Self::Structural,
            _ => Self::Other(value),
        }
    }
}

impl From<DesignType> for String {
    fn from(value: DesignType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Stage-1 artifact. Never mutated; regeneration stores a new revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub project_id: Uuid,
    pub revision: u32,
    pub refined_description: String,
    pub design_type: DesignType,
    #[serde(default)]
    pub key_features: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    pub estimated_parts_count: u32,
    /// Caller feedback that produced this revision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Concept {
    pub fn is_single_part(&self) -> bool {
        self.estimated_parts_count == 1
    }
}
