//! Typed error hierarchy for cadforge.
//!
//! One enum per subsystem:
//! - `GeneratorError` — code generator adapter failures
//! - `ExecutorError` — infrastructure failures around the worker process
//! - `StoreError` — document store failures
//! - `PipelineError` — stage machine and part orchestrator failures
//!
//! Generation-quality failures (missing result binding, runtime faults,
//! timeouts, partial exports) are not errors; they travel as
//! `cadforge_common::UnitOutcome` values.

use std::path::PathBuf;

use cadforge_common::{ProjectStatus, Stage};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the code generator adapter.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Code generator unavailable: {message}")]
    Unavailable { message: String },

    #[error("Code generator returned no usable result: {reason}")]
    EmptyResult { reason: String },
}

impl GeneratorError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn empty(reason: impl Into<String>) -> Self {
        Self::EmptyResult {
            reason: reason.into(),
        }
    }
}

/// Infrastructure errors from the sandboxed executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid unit id '{0}': only ASCII letters, digits, '_' and '-' are allowed")]
    InvalidUnitId(String),

    #[error("No export formats requested")]
    NoFormats,

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write driver script at {path}: {source}")]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on worker process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("Part {part_number} not found in project {project_id}")]
    PartNotFound { project_id: Uuid, part_number: u32 },

    #[error("Part {part_number} of project {project_id} is already generating")]
    PartBusy { project_id: Uuid, part_number: u32 },

    #[error("Unit {unit_id} is already recorded")]
    DuplicateUnit { unit_id: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Errors from the stage machine and part orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid transition from {stage}/{status}: {reason}")]
    InvalidTransition {
        stage: Stage,
        status: ProjectStatus,
        reason: String,
    },

    #[error("Project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("Part {part_number} not found in project {project_id}")]
    PartNotFound { project_id: Uuid, part_number: u32 },

    #[error("Part {part_number} of project {project_id} is already generating")]
    PartBusy { project_id: Uuid, part_number: u32 },

    #[error(transparent)]
    Generation(#[from] GeneratorError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(StoreError),
}

impl PipelineError {
    pub fn invalid(stage: Stage, status: ProjectStatus, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            stage,
            status,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProjectNotFound { id } => Self::ProjectNotFound { id },
            StoreError::PartNotFound {
                project_id,
                part_number,
            } => Self::PartNotFound {
                project_id,
                part_number,
            },
            StoreError::PartBusy {
                project_id,
                part_number,
            } => Self::PartBusy {
                project_id,
                part_number,
            },
            other => Self::Store(other),
        }
    }
}
