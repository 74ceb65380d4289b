//! Shared domain types for the cadforge design pipeline.
//!
//! Everything here is plain data: serde-serializable records that the stage
//! machine, the part orchestrator, the stores and the feedback log pass
//! between each other. No I/O lives in this crate.

pub mod feedback;
pub mod part;
pub mod project;
pub mod unit;

pub use feedback::{CorrectionType, FeedbackEntry, Rating, UnitType};
pub use part::{Dimensions, ManufacturingMethod, Part, PartBreakdown, PartStatus};
pub use project::{
    Complexity, Concept, DesignProject, DesignType, ProjectStatus, Stage, StageApproval,
};
pub use unit::{
    ExportFormat, ExportedFile, FormatFailure, GeneratedUnit, UnitOrigin, UnitOutcome,
    UnitTarget,
};
