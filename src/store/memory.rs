use super::{
    DesignStore, PartOutcome, ProjectUpdate, apply_begin, apply_complete, apply_release,
    apply_settle,
};
use crate::errors::StoreError;
use async_trait::async_trait;
use cadforge_common::{Concept, DesignProject, GeneratedUnit, Part, PartBreakdown, UnitTarget};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    projects: HashMap<Uuid, DesignProject>,
    concepts: HashMap<Uuid, Vec<Concept>>,
    breakdowns: HashMap<Uuid, PartBreakdown>,
    units: Vec<GeneratedUnit>,
    attempts: HashMap<(Uuid, UnitTarget), u32>,
}

impl State {
    /// Project and breakdown borrowed together for part operations.
    fn part_records(
        &mut self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<(&mut DesignProject, &mut PartBreakdown), StoreError> {
        let project = self
            .projects
            .get_mut(&project_id)
            .ok_or(StoreError::ProjectNotFound { id: project_id })?;
        let breakdown = self
            .breakdowns
            .get_mut(&project_id)
            .ok_or(StoreError::PartNotFound {
                project_id,
                part_number,
            })?;
        Ok((project, breakdown))
    }
}

/// Process-local store. Every operation runs under one lock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl DesignStore for MemoryStore {
    async fn insert_project(&self, project: &DesignProject) -> Result<(), StoreError> {
        self.lock()?.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn load_project(&self, id: Uuid) -> Result<DesignProject, StoreError> {
        self.lock()?
            .projects
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProjectNotFound { id })
    }

    async fn list_projects(&self) -> Result<Vec<DesignProject>, StoreError> {
        let mut projects: Vec<_> = self.lock()?.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn update_project(
        &self,
        id: Uuid,
        update: ProjectUpdate,
    ) -> Result<DesignProject, StoreError> {
        let mut state = self.lock()?;
        let project = state
            .projects
            .get_mut(&id)
            .ok_or(StoreError::ProjectNotFound { id })?;
        update(project);
        Ok(project.clone())
    }

    async fn save_concept(&self, concept: &Concept) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let revisions = state.concepts.entry(concept.project_id).or_default();
        revisions.retain(|c| c.revision != concept.revision);
        revisions.push(concept.clone());
        Ok(())
    }

    async fn latest_concept(&self, project_id: Uuid) -> Result<Option<Concept>, StoreError> {
        Ok(self
            .lock()?
            .concepts
            .get(&project_id)
            .and_then(|revs| revs.iter().max_by_key(|c| c.revision))
            .cloned())
    }

    async fn save_breakdown(&self, breakdown: &PartBreakdown) -> Result<(), StoreError> {
        self.lock()?
            .breakdowns
            .insert(breakdown.project_id, breakdown.clone());
        Ok(())
    }

    async fn load_breakdown(&self, project_id: Uuid) -> Result<Option<PartBreakdown>, StoreError> {
        Ok(self.lock()?.breakdowns.get(&project_id).cloned())
    }

    async fn reserve_attempt(
        &self,
        project_id: Uuid,
        target: UnitTarget,
    ) -> Result<u32, StoreError> {
        let mut state = self.lock()?;
        let recorded = state
            .units
            .iter()
            .filter(|u| u.project_id == project_id && u.target == target)
            .map(|u| u.attempt)
            .max()
            .unwrap_or(0);
        let last = state.attempts.entry((project_id, target)).or_insert(0);
        *last = (*last).max(recorded) + 1;
        Ok(*last)
    }

    async fn record_unit(&self, unit: &GeneratedUnit) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.units.iter().any(|u| u.unit_id == unit.unit_id) {
            return Err(StoreError::DuplicateUnit {
                unit_id: unit.unit_id.clone(),
            });
        }
        state.units.push(unit.clone());
        Ok(())
    }

    async fn list_units(
        &self,
        project_id: Uuid,
        target: Option<UnitTarget>,
    ) -> Result<Vec<GeneratedUnit>, StoreError> {
        let mut units: Vec<_> = self
            .lock()?
            .units
            .iter()
            .filter(|u| u.project_id == project_id)
            .filter(|u| target.is_none_or(|t| u.target == t))
            .cloned()
            .collect();
        units.sort_by(|a, b| {
            a.attempt
                .cmp(&b.attempt)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(units)
    }

    async fn load_unit(&self, unit_id: &str) -> Result<Option<GeneratedUnit>, StoreError> {
        Ok(self
            .lock()?
            .units
            .iter()
            .find(|u| u.unit_id == unit_id)
            .cloned())
    }

    async fn begin_part(&self, project_id: Uuid, part_number: u32) -> Result<Part, StoreError> {
        let mut state = self.lock()?;
        let (project, breakdown) = state.part_records(project_id, part_number)?;
        apply_begin(project, breakdown, part_number)
    }

    async fn settle_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<DesignProject, StoreError> {
        let mut state = self.lock()?;
        let (project, breakdown) = state.part_records(project_id, part_number)?;
        apply_settle(project, breakdown, part_number, outcome)?;
        Ok(project.clone())
    }

    async fn release_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let (project, breakdown) = state.part_records(project_id, part_number)?;
        apply_release(project, breakdown, part_number, outcome)
    }

    async fn complete_if_settled(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or(StoreError::ProjectNotFound { id: project_id })?;
        Ok(apply_complete(project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadforge_common::{PartStatus, ProjectStatus, Stage, UnitOrigin, UnitOutcome};
    use chrono::Utc;
    use std::sync::Arc;

    async fn seeded(parts: u32) -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let mut project = DesignProject::new("u", "shelf");
        project.stage = Stage::Generation;
        project.status = ProjectStatus::Generating;
        project.total_parts = parts;
        store.insert_project(&project).await.unwrap();
        let parts = (1..=parts).map(|n| Part::new(n, &format!("p{}", n), "")).collect();
        store
            .save_breakdown(&PartBreakdown::new(project.id, 1, parts))
            .await
            .unwrap();
        (store, project.id)
    }

    fn unit(project_id: Uuid, target: UnitTarget, attempt: u32) -> GeneratedUnit {
        GeneratedUnit {
            unit_id: format!("{}_a{}", target, attempt).replace(' ', ""),
            project_id,
            target,
            attempt,
            origin: UnitOrigin::Generated,
            source: "result = 1".into(),
            description: String::new(),
            formats: Vec::new(),
            outcome: UnitOutcome::Success,
            files: Vec::new(),
            error: None,
            driver_path: None,
            duration_ms: 1,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.load_project(id).await,
            Err(StoreError::ProjectNotFound { .. })
        ));
        assert!(store.update_project(id, Box::new(|_| {})).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_settles_lose_no_updates() {
        let (store, id) = seeded(20).await;
        let mut handles = Vec::new();
        for n in 1..=20u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.begin_part(id, n).await.unwrap();
                let outcome = if n % 4 == 0 {
                    PartOutcome::Failed {
                        unit_id: None,
                        error: "fault".into(),
                    }
                } else {
                    PartOutcome::Completed {
                        unit_id: format!("u{}", n),
                        files: Vec::new(),
                        warning: None,
                    }
                };
                store.settle_part(id, n, outcome).await.unwrap();
                store.complete_if_settled(id).await.unwrap()
            }));
        }
        let mut flips = 0;
        for handle in handles {
            if handle.await.unwrap() {
                flips += 1;
            }
        }

        let project = store.load_project(id).await.unwrap();
        assert_eq!((project.generated_parts, project.failed_parts), (15, 5));
        assert_eq!(project.stage, Stage::Completed);
        assert_eq!(flips, 1);
        let breakdown = store.load_breakdown(id).await.unwrap().unwrap();
        assert_eq!(breakdown.count_with_status(PartStatus::Failed), 5);
    }

    #[tokio::test]
    async fn units_are_filtered_and_ordered() {
        let (store, id) = seeded(2).await;
        let part1 = UnitTarget::Part { number: 1 };
        store.record_unit(&unit(id, part1, 2)).await.unwrap();
        store.record_unit(&unit(id, UnitTarget::OverallModel, 1)).await.unwrap();
        store.record_unit(&unit(id, part1, 1)).await.unwrap();

        let units = store.list_units(id, Some(part1)).await.unwrap();
        assert_eq!(units.iter().map(|u| u.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.list_units(id, None).await.unwrap().len(), 3);
        assert_eq!(store.reserve_attempt(id, part1).await.unwrap(), 3);
        assert_eq!(store.reserve_attempt(id, part1).await.unwrap(), 4);
        assert_eq!(store.reserve_attempt(id, UnitTarget::OverallModel).await.unwrap(), 2);
        assert!(store.load_unit(&units[0].unit_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recorded_unit_is_never_replaced() {
        let (store, id) = seeded(1).await;
        let first = unit(id, UnitTarget::OverallModel, 1);
        store.record_unit(&first).await.unwrap();

        let mut clash = first.clone();
        clash.source = "result = 2".into();
        let err = store.record_unit(&clash).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUnit { .. }));

        let kept = store.load_unit(&first.unit_id).await.unwrap().unwrap();
        assert_eq!(kept.source, "result = 1");
    }

    #[tokio::test]
    async fn latest_concept_wins() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(store.latest_concept(id).await.unwrap().is_none());
        for revision in [1, 3, 2] {
            store
                .save_concept(&Concept {
                    project_id: id,
                    revision,
                    refined_description: format!("rev {}", revision),
                    design_type: "other".to_string().into(),
                    key_features: Vec::new(),
                    complexity: Default::default(),
                    estimated_parts_count: 1,
                    feedback: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.latest_concept(id).await.unwrap().unwrap().revision, 3);
    }
}
