//! One generation+execution attempt as a value.
//!
//! Every attempt gets its own unit id and its own `GeneratedUnit` record, so
//! retries and corrections add history instead of overwriting it.

use crate::errors::StoreError;
use crate::executor::ExecutionResult;
use crate::store::DesignStore;
use cadforge_common::{
    DesignProject, ExportFormat, FeedbackEntry, GeneratedUnit, UnitOrigin, UnitTarget,
};
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub project_id: Uuid,
    pub target: UnitTarget,
    pub number: u32,
    pub origin: UnitOrigin,
    pub unit_id: String,
}

/// Unit id for an attempt: `<short>_overall_a<n>` or `<short>_part<k>_a<n>`.
pub fn unit_id_for(project: &DesignProject, target: UnitTarget, number: u32) -> String {
    match target {
        UnitTarget::OverallModel => format!("{}_overall_a{}", project.short_id(), number),
        UnitTarget::Part { number: part } => {
            format!("{}_part{}_a{}", project.short_id(), part, number)
        }
    }
}

impl Attempt {
    /// Reserve the next attempt for `target`. Overlapping attempts get
    /// distinct numbers, hence distinct unit ids and output files.
    pub async fn next(
        store: &dyn DesignStore,
        project: &DesignProject,
        target: UnitTarget,
        origin: UnitOrigin,
    ) -> Result<Self, StoreError> {
        let number = store.reserve_attempt(project.id, target).await?;
        Ok(Self {
            project_id: project.id,
            target,
            number,
            origin,
            unit_id: unit_id_for(project, target, number),
        })
    }

    /// Persistable record of this attempt's execution.
    pub fn into_unit(
        self,
        source: String,
        description: String,
        formats: &[ExportFormat],
        result: ExecutionResult,
    ) -> GeneratedUnit {
        let error = result.error_text();
        GeneratedUnit {
            unit_id: self.unit_id,
            project_id: self.project_id,
            target: self.target,
            attempt: self.number,
            origin: self.origin,
            source,
            description,
            formats: formats.to_vec(),
            outcome: result.outcome,
            files: result.files,
            error,
            driver_path: result.driver_path,
            duration_ms: result.duration.as_millis() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Feedback entry describing an executed unit.
pub fn outcome_entry(project: &DesignProject, prompt: &str, unit: &GeneratedUnit) -> FeedbackEntry {
    let mut entry = FeedbackEntry::new(
        project.id,
        &project.user_id,
        unit.target,
        &unit.unit_id,
        prompt,
        &unit.source,
    );
    entry.outcome = unit.outcome.kind_str().to_string();
    entry.error_message = unit.error.clone();
    entry.success = unit.outcome.is_success();
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use cadforge_common::UnitOutcome;
    use std::time::Duration;

    #[test]
    fn unit_ids_are_namespaced_per_target() {
        let project = DesignProject::new("u", "box");
        let short = project.short_id();
        assert_eq!(
            unit_id_for(&project, UnitTarget::OverallModel, 2),
            format!("{}_overall_a2", short)
        );
        assert_eq!(
            unit_id_for(&project, UnitTarget::Part { number: 3 }, 1),
            format!("{}_part3_a1", short)
        );
    }

    #[tokio::test]
    async fn attempts_count_up_per_target() {
        let store = MemoryStore::new();
        let project = DesignProject::new("u", "box");
        store.insert_project(&project).await.unwrap();
        let target = UnitTarget::Part { number: 1 };

        let first = Attempt::next(&store, &project, target, UnitOrigin::Generated)
            .await
            .unwrap();
        assert_eq!(first.number, 1);

        let result = ExecutionResult {
            unit_id: first.unit_id.clone(),
            outcome: UnitOutcome::Timeout { limit_secs: 1 },
            files: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            driver_path: None,
            worker_pid: None,
            duration: Duration::from_millis(1500),
        };
        let unit = first.into_unit("while True: pass".into(), String::new(), &[], result);
        assert_eq!(unit.duration_ms, 1500);
        assert!(unit.error.as_deref().unwrap().contains("timed out"));
        store.record_unit(&unit).await.unwrap();

        let second = Attempt::next(&store, &project, target, UnitOrigin::Correction)
            .await
            .unwrap();
        assert_eq!(second.number, 2);
        assert!(second.unit_id.ends_with("_part1_a2"));

        let overall = Attempt::next(&store, &project, UnitTarget::OverallModel, UnitOrigin::Generated)
            .await
            .unwrap();
        assert_eq!(overall.number, 1);

        let entry = outcome_entry(&project, "a box", &unit);
        assert_eq!(entry.outcome, "timeout");
        assert!(!entry.success);
        assert_eq!(entry.part_number, Some(1));
    }
}
