//! Part Unit Orchestrator.
//!
//! Drives generation and execution for each part of a breakdown. A failing
//! part never blocks the others, and every counter update goes through the
//! store's atomic part operations.

mod orchestrator;

pub use orchestrator::{
    GenerationSummary, OrchestratorSettings, PartEvent, PartOrchestrator, PartReport,
};
