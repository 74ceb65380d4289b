//! Stage State Machine.
//!
//! A project moves `concept → overall_model → parts → generation →
//! completed`, one explicit approval at a time. `status` tracks progress
//! inside the current stage:
//!
//! | status       | meaning                                              |
//! |--------------|------------------------------------------------------|
//! | `pending`    | the stage's output exists and awaits approval        |
//! | `failed`     | the latest attempt for the stage failed              |
//! | `generating` | parts are being generated (stage `generation`)       |
//! | `completed`  | terminal                                             |
//!
//! Nothing is retried automatically; `regenerate` re-runs the current stage
//! without moving it.

mod machine;

pub use machine::DesignPipeline;

use crate::parts::GenerationSummary;
use cadforge_common::{
    Concept, CorrectionType, DesignProject, GeneratedUnit, PartBreakdown, Rating, UnitTarget,
};

/// Caller-supplied approval details.
#[derive(Debug, Clone, Default)]
pub struct Approval {
    pub approved_by: Option<String>,
    pub note: Option<String>,
}

impl Approval {
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            approved_by: Some(user.into()),
            note: None,
        }
    }
}

/// Artifact produced by a stage run.
#[derive(Debug, Clone)]
pub enum StageArtifact {
    Concept(Concept),
    OverallModel(GeneratedUnit),
    Breakdown(PartBreakdown),
    Parts(GenerationSummary),
    /// The stage was entered without producing anything new.
    Entered,
}

/// Project state after an `advance` or `regenerate`, plus what was produced.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub project: DesignProject,
    pub artifact: StageArtifact,
}

/// Human feedback about a unit.
#[derive(Debug, Clone)]
pub struct FeedbackSubmission {
    pub target: UnitTarget,
    pub rating: Rating,
    pub text: Option<String>,
    pub corrected_code: Option<String>,
    pub correction_type: Option<CorrectionType>,
    /// Run corrected code through the executor and record the result.
    pub validate: bool,
}

impl FeedbackSubmission {
    pub fn rating(target: UnitTarget, rating: Rating) -> Self {
        Self {
            target,
            rating,
            text: None,
            corrected_code: None,
            correction_type: None,
            validate: false,
        }
    }
}

/// Result of applying human-corrected source.
///
/// `unit` is `None` when the source never reached the executor; `error` is
/// set whenever the corrected target did not complete.
#[derive(Debug, Clone)]
pub struct CorrectionReport {
    pub project: DesignProject,
    pub unit: Option<GeneratedUnit>,
    pub error: Option<String>,
}
