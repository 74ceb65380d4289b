//! Document store boundary.
//!
//! The pipeline never talks to a database directly; it receives a
//! `DesignStore` handle. Two implementations ship:
//! - `MemoryStore` — process-local, for tests and one-shot runs
//! - `SqliteStore` — durable, backing the CLI
//!
//! Part counters are the only state written from concurrent code paths, so
//! every counter change goes through one of the atomic operations here
//! (`update_project`, `begin_part`, `settle_part`, `complete_if_settled`).
//! Attempt numbers are handed out by `reserve_attempt`, and a recorded unit
//! is never replaced.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{DbHandle, SqliteStore};

use crate::errors::StoreError;
use async_trait::async_trait;
use cadforge_common::{
    Concept, DesignProject, ExportedFile, GeneratedUnit, Part, PartBreakdown, PartStatus,
    ProjectStatus, Stage, UnitTarget,
};
use chrono::Utc;
use uuid::Uuid;

/// In-place change applied to the freshest copy of a project.
pub type ProjectUpdate = Box<dyn FnOnce(&mut DesignProject) + Send + 'static>;

/// Terminal result for one part attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PartOutcome {
    Completed {
        unit_id: String,
        files: Vec<ExportedFile>,
        /// Set when the part counts as completed despite a partial export.
        warning: Option<String>,
    },
    Failed {
        unit_id: Option<String>,
        error: String,
    },
}

impl PartOutcome {
    pub fn status(&self) -> PartStatus {
        match self {
            Self::Completed { .. } => PartStatus::Completed,
            Self::Failed { .. } => PartStatus::Failed,
        }
    }
}

#[async_trait]
pub trait DesignStore: Send + Sync {
    async fn insert_project(&self, project: &DesignProject) -> Result<(), StoreError>;

    async fn load_project(&self, id: Uuid) -> Result<DesignProject, StoreError>;

    /// All projects, most recently created first.
    async fn list_projects(&self) -> Result<Vec<DesignProject>, StoreError>;

    /// Atomically apply `update` to the stored project and return the result.
    async fn update_project(
        &self,
        id: Uuid,
        update: ProjectUpdate,
    ) -> Result<DesignProject, StoreError>;

    async fn save_concept(&self, concept: &Concept) -> Result<(), StoreError>;

    /// Highest revision for the project, if any concept exists.
    async fn latest_concept(&self, project_id: Uuid) -> Result<Option<Concept>, StoreError>;

    /// Replace the project's current breakdown.
    async fn save_breakdown(&self, breakdown: &PartBreakdown) -> Result<(), StoreError>;

    async fn load_breakdown(&self, project_id: Uuid) -> Result<Option<PartBreakdown>, StoreError>;

    /// Reserve the next attempt number for a target.
    ///
    /// Each number is handed out once, even to overlapping attempts.
    async fn reserve_attempt(
        &self,
        project_id: Uuid,
        target: UnitTarget,
    ) -> Result<u32, StoreError>;

    /// Fails with `DuplicateUnit` when the unit id is already recorded.
    async fn record_unit(&self, unit: &GeneratedUnit) -> Result<(), StoreError>;

    /// Attempts for a project, optionally for one target, in attempt order.
    async fn list_units(
        &self,
        project_id: Uuid,
        target: Option<UnitTarget>,
    ) -> Result<Vec<GeneratedUnit>, StoreError>;

    async fn load_unit(&self, unit_id: &str) -> Result<Option<GeneratedUnit>, StoreError>;

    /// Mark a part `generating`, un-counting any previous outcome.
    ///
    /// Fails with `PartBusy` when the part is already generating.
    async fn begin_part(&self, project_id: Uuid, part_number: u32) -> Result<Part, StoreError>;

    /// Record a part's terminal outcome and bump the matching counter.
    async fn settle_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<DesignProject, StoreError>;

    /// Settle a part only while it is still `generating`.
    ///
    /// Returns false, changing nothing, when the part already settled.
    async fn release_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<bool, StoreError>;

    /// Flip `generation` to `completed` once every part has settled.
    ///
    /// Returns true only for the call that performed the flip.
    async fn complete_if_settled(&self, project_id: Uuid) -> Result<bool, StoreError>;
}

fn uncount(project: &mut DesignProject, previous: PartStatus) {
    match previous {
        PartStatus::Completed => {
            project.generated_parts = project.generated_parts.saturating_sub(1)
        }
        PartStatus::Failed => project.failed_parts = project.failed_parts.saturating_sub(1),
        PartStatus::Pending | PartStatus::Generating => {}
    }
}

pub(crate) fn apply_begin(
    project: &mut DesignProject,
    breakdown: &mut PartBreakdown,
    part_number: u32,
) -> Result<Part, StoreError> {
    let project_id = project.id;
    let part = breakdown
        .part_mut(part_number)
        .ok_or(StoreError::PartNotFound {
            project_id,
            part_number,
        })?;
    if part.status == PartStatus::Generating {
        return Err(StoreError::PartBusy {
            project_id,
            part_number,
        });
    }

    uncount(project, part.status);
    part.status = PartStatus::Generating;
    part.error = None;
    project.touch();
    Ok(part.clone())
}

pub(crate) fn apply_settle(
    project: &mut DesignProject,
    breakdown: &mut PartBreakdown,
    part_number: u32,
    outcome: PartOutcome,
) -> Result<(), StoreError> {
    let project_id = project.id;
    let part = breakdown
        .part_mut(part_number)
        .ok_or(StoreError::PartNotFound {
            project_id,
            part_number,
        })?;

    uncount(project, part.status);
    match outcome {
        PartOutcome::Completed {
            unit_id,
            files,
            warning,
        } => {
            part.status = PartStatus::Completed;
            part.current_unit_id = Some(unit_id);
            part.files = files;
            part.error = warning;
            project.generated_parts += 1;
        }
        PartOutcome::Failed { unit_id, error } => {
            part.status = PartStatus::Failed;
            if unit_id.is_some() {
                part.current_unit_id = unit_id;
            }
            part.files.clear();
            part.error = Some(error);
            project.failed_parts += 1;
        }
    }
    project.touch();
    Ok(())
}

pub(crate) fn apply_release(
    project: &mut DesignProject,
    breakdown: &mut PartBreakdown,
    part_number: u32,
    outcome: PartOutcome,
) -> Result<bool, StoreError> {
    let generating = breakdown
        .part(part_number)
        .is_some_and(|p| p.status == PartStatus::Generating);
    if !generating {
        return Ok(false);
    }
    apply_settle(project, breakdown, part_number, outcome)?;
    Ok(true)
}

pub(crate) fn apply_complete(project: &mut DesignProject) -> bool {
    if project.stage != Stage::Generation || !project.all_parts_settled() {
        return false;
    }
    let now = Utc::now();
    project.stage = Stage::Completed;
    project.status = ProjectStatus::Completed;
    project.completed_at = Some(now);
    project.updated_at = now;
    true
}
