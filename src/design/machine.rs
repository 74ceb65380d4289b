use super::{Approval, CorrectionReport, FeedbackSubmission, StageArtifact, StageOutput};
use crate::attempt::{Attempt, outcome_entry};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::executor::SandboxedExecutor;
use crate::feedback::FeedbackLogger;
use crate::generator::{self, CodeGenerator, GenerationRequest, StageHint, payload};
use crate::parts::{
    GenerationSummary, OrchestratorSettings, PartEvent, PartOrchestrator, PartReport,
};
use crate::store::{DesignStore, PartOutcome};
use cadforge_common::{
    Concept, CorrectionType, DesignProject, FeedbackEntry, GeneratedUnit, Part, PartBreakdown,
    PartStatus, ProjectStatus, Rating, Stage, StageApproval, UnitOrigin, UnitOutcome, UnitTarget,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const SINGLE_PART_NAME: &str = "Whole object";
const ACCEPTED_WITHOUT_GENERATION: &str = "accepted without generation";

fn approval_record(from: Stage, to: Stage, approval: &Approval) -> StageApproval {
    StageApproval {
        from,
        to,
        approved_by: approval.approved_by.clone(),
        note: approval.note.clone(),
        at: Utc::now(),
    }
}

/// The stage machine, wired to its collaborators.
pub struct DesignPipeline {
    store: Arc<dyn DesignStore>,
    generator: Arc<dyn CodeGenerator>,
    executor: Arc<SandboxedExecutor>,
    feedback: Arc<FeedbackLogger>,
    parts: PartOrchestrator,
}

impl DesignPipeline {
    pub fn new(
        store: Arc<dyn DesignStore>,
        generator: Arc<dyn CodeGenerator>,
        executor: Arc<SandboxedExecutor>,
        feedback: Arc<FeedbackLogger>,
        settings: OrchestratorSettings,
    ) -> Self {
        let parts = PartOrchestrator::new(
            store.clone(),
            generator.clone(),
            executor.clone(),
            feedback.clone(),
            settings,
        );
        Self {
            store,
            generator,
            executor,
            feedback,
            parts,
        }
    }

    /// Build the pipeline described by `config` on top of `store`.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn DesignStore>,
    ) -> Result<Self, PipelineError> {
        let generator = generator::from_config(&config.toml.generator)?;
        let executor = Arc::new(SandboxedExecutor::from_config(&config.toml.executor));
        let feedback = Arc::new(if config.toml.feedback.enabled {
            FeedbackLogger::new(&config.feedback_dir)
        } else {
            FeedbackLogger::disabled()
        });
        Ok(Self::new(
            store,
            generator,
            executor,
            feedback,
            OrchestratorSettings::from_config(config),
        ))
    }

    /// Route part progress events to `tx`.
    pub fn with_part_events(mut self, tx: mpsc::Sender<PartEvent>) -> Self {
        self.parts = self.parts.with_event_channel(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn DesignStore> {
        &self.store
    }

    fn accepts(&self, outcome: &UnitOutcome) -> bool {
        match outcome {
            UnitOutcome::Success => true,
            UnitOutcome::PartialExport { .. } => self.parts.settings().accept_partial_export,
            _ => false,
        }
    }

    fn status_for(&self, unit: &GeneratedUnit) -> ProjectStatus {
        if self.accepts(&unit.outcome) {
            ProjectStatus::Pending
        } else {
            ProjectStatus::Failed
        }
    }

    async fn require_concept(&self, project: &DesignProject) -> Result<Concept, PipelineError> {
        self.store.latest_concept(project.id).await?.ok_or_else(|| {
            PipelineError::invalid(project.stage, project.status, "project has no concept yet")
        })
    }

    async fn current_overall(
        &self,
        project: &DesignProject,
    ) -> Result<Option<GeneratedUnit>, PipelineError> {
        match &project.overall_unit_id {
            Some(unit_id) => Ok(self.store.load_unit(unit_id).await?),
            None => Ok(None),
        }
    }

    // ── Project lifecycle ────────────────────────────────────────────────

    /// Persist a new project awaiting its first concept.
    pub async fn create_project(
        &self,
        user_id: &str,
        prompt: &str,
    ) -> Result<DesignProject, PipelineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::invalid(
                Stage::Concept,
                ProjectStatus::Pending,
                "the design prompt is empty",
            ));
        }
        let project = DesignProject::new(user_id, prompt);
        self.store.insert_project(&project).await?;
        tracing::info!(project_id = %project.id, user_id, "Created design project");
        Ok(project)
    }

    /// Create a project and generate its first concept.
    ///
    /// The project is kept even when concept generation fails, so the caller
    /// can retry with `regenerate`.
    pub async fn start(
        &self,
        user_id: &str,
        prompt: &str,
    ) -> Result<(DesignProject, Result<StageOutput, PipelineError>), PipelineError> {
        let project = self.create_project(user_id, prompt).await?;
        let output = self.regenerate(project.id, None).await;
        Ok((project, output))
    }

    /// Approve the current stage's output and move to the next stage.
    pub async fn advance(&self, id: Uuid, approval: Approval) -> Result<StageOutput, PipelineError> {
        let project = self.store.load_project(id).await?;
        if project.stage.is_terminal() {
            return Err(PipelineError::invalid(
                project.stage,
                project.status,
                "project is already completed",
            ));
        }
        if project.status != ProjectStatus::Pending {
            return Err(PipelineError::invalid(
                project.stage,
                project.status,
                "the current stage has no output awaiting approval",
            ));
        }

        let output = match project.stage {
            Stage::Concept => self.enter_overall_model(&project, approval).await?,
            Stage::OverallModel => {
                let concept = self.require_concept(&project).await?;
                if self.current_overall(&project).await?.is_none() {
                    return Err(PipelineError::invalid(
                        project.stage,
                        project.status,
                        "no whole-object model has been generated",
                    ));
                }
                if concept.is_single_part() {
                    self.complete_single_part(&project, &concept, approval).await?
                } else {
                    self.enter_parts(&project, &concept, approval).await?
                }
            }
            Stage::Parts => {
                if self.store.load_breakdown(id).await?.is_none() {
                    return Err(PipelineError::invalid(
                        project.stage,
                        project.status,
                        "project has no part breakdown",
                    ));
                }
                let record = approval_record(Stage::Parts, Stage::Generation, &approval);
                let project = self
                    .store
                    .update_project(
                        id,
                        Box::new(move |p| {
                            p.approvals.push(record);
                            p.stage = Stage::Generation;
                            p.status = ProjectStatus::Generating;
                            p.touch();
                        }),
                    )
                    .await?;
                StageOutput {
                    project,
                    artifact: StageArtifact::Entered,
                }
            }
            Stage::Generation | Stage::Completed => {
                return Err(PipelineError::invalid(
                    project.stage,
                    project.status,
                    "generation completes once every part has settled; \
                     generate the remaining parts or accept the partial result",
                ));
            }
        };

        tracing::info!(
            project_id = %id,
            from = %project.stage,
            to = %output.project.stage,
            status = %output.project.status,
            "Stage advanced"
        );
        Ok(output)
    }

    async fn enter_overall_model(
        &self,
        project: &DesignProject,
        approval: Approval,
    ) -> Result<StageOutput, PipelineError> {
        let concept = self.require_concept(project).await?;
        let unit = self.produce_overall(project, &concept, None).await?;
        let status = self.status_for(&unit);
        let unit_id = unit.unit_id.clone();
        let record = approval_record(Stage::Concept, Stage::OverallModel, &approval);
        let project = self
            .store
            .update_project(
                project.id,
                Box::new(move |p| {
                    p.approvals.push(record);
                    p.stage = Stage::OverallModel;
                    p.status = status;
                    p.overall_unit_id = Some(unit_id);
                    p.touch();
                }),
            )
            .await?;
        Ok(StageOutput {
            project,
            artifact: StageArtifact::OverallModel(unit),
        })
    }

    async fn enter_parts(
        &self,
        project: &DesignProject,
        concept: &Concept,
        approval: Approval,
    ) -> Result<StageOutput, PipelineError> {
        let breakdown = self.produce_breakdown(project, concept, None).await?;
        self.store.save_breakdown(&breakdown).await?;
        let total = breakdown.len() as u32;
        let record = approval_record(Stage::OverallModel, Stage::Parts, &approval);
        let project = self
            .store
            .update_project(
                project.id,
                Box::new(move |p| {
                    p.approvals.push(record);
                    p.stage = Stage::Parts;
                    p.status = ProjectStatus::Pending;
                    p.total_parts = total;
                    p.generated_parts = 0;
                    p.failed_parts = 0;
                    p.touch();
                }),
            )
            .await?;
        Ok(StageOutput {
            project,
            artifact: StageArtifact::Breakdown(breakdown),
        })
    }

    /// Single-part designs reuse the whole-object unit as part 1 and walk the
    /// remaining stages in order within one approval.
    async fn complete_single_part(
        &self,
        project: &DesignProject,
        concept: &Concept,
        approval: Approval,
    ) -> Result<StageOutput, PipelineError> {
        let unit = self.current_overall(project).await?.ok_or_else(|| {
            PipelineError::invalid(project.stage, project.status, "no whole-object model")
        })?;

        let mut part = Part::new(1, SINGLE_PART_NAME, &concept.refined_description);
        part.complexity = concept.complexity;
        part.status = PartStatus::Completed;
        part.current_unit_id = Some(unit.unit_id.clone());
        part.files = unit.files.clone();
        part.error = unit.error.clone();
        let breakdown = PartBreakdown::new(project.id, 1, vec![part]);
        self.store.save_breakdown(&breakdown).await?;

        let records: Vec<StageApproval> = [
            (Stage::OverallModel, Stage::Parts),
            (Stage::Parts, Stage::Generation),
            (Stage::Generation, Stage::Completed),
        ]
        .into_iter()
        .map(|(from, to)| approval_record(from, to, &approval))
        .collect();

        let project = self
            .store
            .update_project(
                project.id,
                Box::new(move |p| {
                    p.approvals.extend(records);
                    p.stage = Stage::Completed;
                    p.status = ProjectStatus::Completed;
                    p.total_parts = 1;
                    p.generated_parts = 1;
                    p.failed_parts = 0;
                    p.completed_at = Some(Utc::now());
                    p.touch();
                }),
            )
            .await?;
        tracing::info!(
            project_id = %project.id,
            unit_id = %unit.unit_id,
            "Single-part design completed from the whole-object model"
        );
        Ok(StageOutput {
            project,
            artifact: StageArtifact::Breakdown(breakdown),
        })
    }

    /// Re-run the current stage without moving it.
    ///
    /// `feedback` is passed to the generator for the concept, whole-object
    /// and breakdown stages. In `generation` and `completed` every part that
    /// has not completed is retried.
    pub async fn regenerate(
        &self,
        id: Uuid,
        feedback: Option<&str>,
    ) -> Result<StageOutput, PipelineError> {
        let project = self.store.load_project(id).await?;
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());

        let (status, artifact) = match project.stage {
            Stage::Concept => {
                let concept = self.produce_concept(&project, feedback).await?;
                self.store.save_concept(&concept).await?;
                (ProjectStatus::Pending, StageArtifact::Concept(concept))
            }
            Stage::OverallModel => {
                let concept = self.require_concept(&project).await?;
                let unit = self.produce_overall(&project, &concept, feedback).await?;
                let status = self.status_for(&unit);
                let unit_id = unit.unit_id.clone();
                self.store
                    .update_project(id, Box::new(move |p| p.overall_unit_id = Some(unit_id)))
                    .await?;
                (status, StageArtifact::OverallModel(unit))
            }
            Stage::Parts => {
                let concept = self.require_concept(&project).await?;
                let breakdown = self.produce_breakdown(&project, &concept, feedback).await?;
                self.store.save_breakdown(&breakdown).await?;
                let total = breakdown.len() as u32;
                self.store
                    .update_project(
                        id,
                        Box::new(move |p| {
                            p.total_parts = total;
                            p.generated_parts = 0;
                            p.failed_parts = 0;
                        }),
                    )
                    .await?;
                (ProjectStatus::Pending, StageArtifact::Breakdown(breakdown))
            }
            Stage::Generation | Stage::Completed => {
                let summary = self.parts.retry_unfinished(id).await?;
                let project = self.store.load_project(id).await?;
                return Ok(StageOutput {
                    project,
                    artifact: StageArtifact::Parts(summary),
                });
            }
        };

        let project = self
            .store
            .update_project(
                id,
                Box::new(move |p| {
                    p.status = status;
                    p.touch();
                }),
            )
            .await?;
        tracing::info!(
            project_id = %id,
            stage = %project.stage,
            status = %project.status,
            "Stage regenerated"
        );
        Ok(StageOutput { project, artifact })
    }

    // ── Stage producers ──────────────────────────────────────────────────
    //
    // Each producer calls the generator first and writes nothing when the
    // generator fails.

    async fn produce_concept(
        &self,
        project: &DesignProject,
        feedback: Option<&str>,
    ) -> Result<Concept, PipelineError> {
        let previous = self.store.latest_concept(project.id).await?;
        let revision = previous.as_ref().map_or(1, |c| c.revision + 1);

        let mut request = GenerationRequest::new(project.original_prompt.clone(), StageHint::Concept);
        if let Some(previous) = &previous {
            request = request.with_context("previous_concept", previous.refined_description.clone());
        }
        if let Some(feedback) = feedback {
            request = request.with_context("feedback", feedback);
        }

        let generated = self.generator.generate(&request).await?;
        let concept = payload::parse_concept(project.id, revision, feedback, &generated)?;
        tracing::info!(
            project_id = %project.id,
            revision,
            design_type = concept.design_type.as_str(),
            parts = concept.estimated_parts_count,
            "Concept generated"
        );
        Ok(concept)
    }

    async fn produce_overall(
        &self,
        project: &DesignProject,
        concept: &Concept,
        feedback: Option<&str>,
    ) -> Result<GeneratedUnit, PipelineError> {
        let mut request =
            GenerationRequest::new(concept.refined_description.clone(), StageHint::OverallModel)
                .with_context("original_prompt", project.original_prompt.clone())
                .with_context("design_type", concept.design_type.as_str())
                .with_context("key_features", concept.key_features.clone())
                .with_context("complexity", concept.complexity.as_str());
        if let Some(feedback) = feedback {
            request = request.with_context("feedback", feedback);
        }

        let generated = self.generator.generate(&request).await?;
        let source = payload::source_code(&generated)?;
        let unit = self
            .execute_overall(project, source, generated.description, UnitOrigin::Generated)
            .await?;

        if unit.outcome.is_feedback_worthy() {
            let mut entry = outcome_entry(project, &concept.refined_description, &unit);
            entry.success = self.accepts(&unit.outcome);
            self.feedback.record(&entry);
        }
        Ok(unit)
    }

    async fn execute_overall(
        &self,
        project: &DesignProject,
        source: String,
        description: String,
        origin: UnitOrigin,
    ) -> Result<GeneratedUnit, PipelineError> {
        let settings = self.parts.settings();
        let attempt =
            Attempt::next(self.store.as_ref(), project, UnitTarget::OverallModel, origin).await?;
        let result = self
            .executor
            .execute(
                &source,
                &attempt.unit_id,
                &settings.formats,
                &settings.project_dir(project.id),
            )
            .await?;
        let unit = attempt.into_unit(source, description, &settings.formats, result);
        self.store.record_unit(&unit).await?;
        tracing::info!(
            project_id = %project.id,
            unit_id = %unit.unit_id,
            outcome = unit.outcome.kind_str(),
            "Whole-object model executed"
        );
        Ok(unit)
    }

    async fn produce_breakdown(
        &self,
        project: &DesignProject,
        concept: &Concept,
        feedback: Option<&str>,
    ) -> Result<PartBreakdown, PipelineError> {
        let revision = self
            .store
            .load_breakdown(project.id)
            .await?
            .map_or(1, |b| b.revision + 1);

        let mut request =
            GenerationRequest::new(concept.refined_description.clone(), StageHint::Parts)
                .with_context("original_prompt", project.original_prompt.clone())
                .with_context("estimated_parts_count", concept.estimated_parts_count)
                .with_context("complexity", concept.complexity.as_str());
        if let Some(feedback) = feedback {
            request = request.with_context("feedback", feedback);
        }

        let generated = self.generator.generate(&request).await?;
        let breakdown = payload::parse_breakdown(project.id, revision, &generated)?;
        let methods: Vec<String> = breakdown
            .count_by_method()
            .iter()
            .map(|(method, count)| format!("{}={}", method, count))
            .collect();
        tracing::info!(
            project_id = %project.id,
            revision,
            parts = breakdown.len(),
            methods = %methods.join(","),
            "Part breakdown generated"
        );
        Ok(breakdown)
    }

    // ── Parts ────────────────────────────────────────────────────────────

    pub async fn generate_part(
        &self,
        id: Uuid,
        part_number: u32,
    ) -> Result<PartReport, PipelineError> {
        self.parts.generate_part(id, part_number).await
    }

    pub async fn generate_all(&self, id: Uuid) -> Result<GenerationSummary, PipelineError> {
        self.parts.generate_all(id).await
    }

    /// Accept the current part results as final.
    ///
    /// Parts never generated are settled as failed so the project can
    /// complete; parts still generating block the call.
    pub async fn accept_partial(
        &self,
        id: Uuid,
        approval: Approval,
    ) -> Result<DesignProject, PipelineError> {
        let project = self.store.load_project(id).await?;
        if project.stage != Stage::Generation {
            return Err(PipelineError::invalid(
                project.stage,
                project.status,
                "only a project in generation can be accepted",
            ));
        }
        let breakdown = self.store.load_breakdown(id).await?.ok_or_else(|| {
            PipelineError::invalid(project.stage, project.status, "project has no part breakdown")
        })?;
        if let Some(busy) = breakdown
            .parts
            .iter()
            .find(|p| p.status == PartStatus::Generating)
        {
            return Err(PipelineError::PartBusy {
                project_id: id,
                part_number: busy.part_number,
            });
        }

        for part in breakdown.parts.iter().filter(|p| p.status == PartStatus::Pending) {
            self.store
                .settle_part(
                    id,
                    part.part_number,
                    PartOutcome::Failed {
                        unit_id: None,
                        error: ACCEPTED_WITHOUT_GENERATION.to_string(),
                    },
                )
                .await?;
        }

        if self.store.complete_if_settled(id).await? {
            let record = approval_record(Stage::Generation, Stage::Completed, &approval);
            let project = self
                .store
                .update_project(id, Box::new(move |p| p.approvals.push(record)))
                .await?;
            tracing::info!(
                project_id = %id,
                failed_parts = project.failed_parts,
                "Partial result accepted"
            );
            return Ok(project);
        }
        Ok(self.store.load_project(id).await?)
    }

    // ── Corrections and feedback ─────────────────────────────────────────

    /// Execute human-corrected source as a new attempt for `target`.
    ///
    /// The whole-object model can only be corrected before it is approved;
    /// parts can be corrected during `generation` and after completion.
    pub async fn apply_correction(
        &self,
        id: Uuid,
        target: UnitTarget,
        code: &str,
    ) -> Result<CorrectionReport, PipelineError> {
        let project = self.store.load_project(id).await?;
        let source = crate::util::strip_code_fence(code);
        if source.trim().is_empty() {
            return Err(PipelineError::invalid(
                project.stage,
                project.status,
                "corrected code is empty",
            ));
        }

        let (previous, prompt, unit, error) = match target {
            UnitTarget::OverallModel => {
                if project.stage != Stage::OverallModel {
                    return Err(PipelineError::invalid(
                        project.stage,
                        project.status,
                        "the whole-object model can only be corrected before it is approved",
                    ));
                }
                let previous = self.current_overall(&project).await?;
                let prompt = match self.store.latest_concept(id).await? {
                    Some(concept) => concept.refined_description,
                    None => project.original_prompt.clone(),
                };
                let unit = self
                    .execute_overall(
                        &project,
                        source,
                        "human correction".to_string(),
                        UnitOrigin::Correction,
                    )
                    .await?;
                let status = self.status_for(&unit);
                let unit_id = unit.unit_id.clone();
                self.store
                    .update_project(
                        id,
                        Box::new(move |p| {
                            p.overall_unit_id = Some(unit_id);
                            p.status = status;
                            p.touch();
                        }),
                    )
                    .await?;
                let error = if self.accepts(&unit.outcome) {
                    None
                } else {
                    unit.error.clone()
                };
                (previous, prompt, Some(unit), error)
            }
            UnitTarget::Part { number } => {
                let breakdown = self.store.load_breakdown(id).await?;
                let part = breakdown
                    .as_ref()
                    .and_then(|b| b.part(number))
                    .ok_or(PipelineError::PartNotFound {
                        project_id: id,
                        part_number: number,
                    })?;
                let previous = match &part.current_unit_id {
                    Some(unit_id) => self.store.load_unit(unit_id).await?,
                    None => None,
                };
                let prompt = part.generation_prompt();
                let (report, unit) = self.parts.correct_part(id, number, &source).await?;
                let error = if report.is_completed() { None } else { report.error };
                (previous, prompt, unit, error)
            }
        };

        if let Some(unit) = &unit {
            let mut entry = FeedbackEntry::new(
                id,
                &project.user_id,
                target,
                &unit.unit_id,
                &prompt,
                previous.as_ref().map_or("", |p| p.source.as_str()),
            );
            entry.rating = Some(Rating::Corrected);
            entry.outcome = unit.outcome.kind_str().to_string();
            entry.error_message = unit.error.clone();
            entry.corrected_code = Some(unit.source.clone());
            entry.correction_type = Some(CorrectionType::CodeFix);
            entry.success = self.accepts(&unit.outcome);
            entry.validated = true;
            self.feedback.record(&entry);
        }

        let project = self.store.load_project(id).await?;
        tracing::info!(
            project_id = %id,
            target = %target,
            outcome = unit.as_ref().map_or("not_executed", |u| u.outcome.kind_str()),
            "Correction applied"
        );
        Ok(CorrectionReport {
            project,
            unit,
            error,
        })
    }

    /// Record a human rating of the current unit for `target`.
    pub async fn submit_feedback(
        &self,
        id: Uuid,
        submission: FeedbackSubmission,
    ) -> Result<FeedbackEntry, PipelineError> {
        let project = self.store.load_project(id).await?;
        let (unit_id, prompt) = match submission.target {
            UnitTarget::OverallModel => {
                let prompt = match self.store.latest_concept(id).await? {
                    Some(concept) => concept.refined_description,
                    None => project.original_prompt.clone(),
                };
                (project.overall_unit_id.clone(), prompt)
            }
            UnitTarget::Part { number } => {
                let breakdown = self.store.load_breakdown(id).await?;
                let part = breakdown
                    .as_ref()
                    .and_then(|b| b.part(number))
                    .ok_or(PipelineError::PartNotFound {
                        project_id: id,
                        part_number: number,
                    })?;
                (part.current_unit_id.clone(), part.generation_prompt())
            }
        };
        let unit = match unit_id {
            Some(unit_id) => self.store.load_unit(&unit_id).await?,
            None => None,
        }
        .ok_or_else(|| {
            PipelineError::invalid(
                project.stage,
                project.status,
                format!("{} has no generated unit to rate", submission.target),
            )
        })?;

        let mut entry = outcome_entry(&project, &prompt, &unit);
        entry.rating = Some(submission.rating);
        entry.feedback_text = submission.text.filter(|t| !t.trim().is_empty());
        entry.success = matches!(submission.rating, Rating::Good | Rating::Ok);

        if let Some(corrected) = submission.corrected_code.filter(|c| !c.trim().is_empty()) {
            let corrected = crate::util::strip_code_fence(&corrected);
            entry.correction_type = Some(
                submission
                    .correction_type
                    .unwrap_or(CorrectionType::CodeFix),
            );
            if submission.validate {
                let validated = self.validate_correction(&project, &unit, &corrected).await?;
                entry.validated = true;
                entry.success = validated;
            }
            entry.corrected_code = Some(corrected);
        }

        self.feedback.record(&entry);
        tracing::info!(
            project_id = %id,
            unit_id = %entry.unit_id,
            rating = %submission.rating,
            "Feedback submitted"
        );
        Ok(entry)
    }

    /// Run corrected source once without touching project state.
    async fn validate_correction(
        &self,
        project: &DesignProject,
        unit: &GeneratedUnit,
        source: &str,
    ) -> Result<bool, PipelineError> {
        let settings = self.parts.settings();
        let check_id = format!("{}_check{}", unit.unit_id, Utc::now().timestamp_millis());
        let dir = settings.project_dir(project.id).join("validation");
        let result = self
            .executor
            .execute(source, &check_id, &settings.formats, &dir)
            .await?;
        tracing::debug!(
            unit_id = %unit.unit_id,
            check_id = %check_id,
            outcome = result.outcome.kind_str(),
            "Validated corrected code"
        );
        Ok(self.accepts(&result.outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ShellRuntime;
    use crate::generator::ScriptedGenerator;
    use crate::generator::scripted::{breakdown_answer, concept_answer};
    use crate::store::MemoryStore;
    use cadforge_common::ExportFormat;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        pipeline: DesignPipeline,
        generator: Arc<ScriptedGenerator>,
        dir: TempDir,
    }

    fn harness(generator: ScriptedGenerator) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(generator);
        let executor = SandboxedExecutor::new(
            Arc::new(ShellRuntime::new("sh")),
            Duration::from_secs(5),
            "result",
        );
        let pipeline = DesignPipeline::new(
            Arc::new(MemoryStore::new()),
            generator.clone(),
            Arc::new(executor),
            Arc::new(FeedbackLogger::new(&dir.path().join("feedback"))),
            OrchestratorSettings {
                formats: vec![ExportFormat::Step, ExportFormat::Stl],
                output_root: dir.path().join("outputs"),
                max_parallel: 2,
                accept_partial_export: true,
            },
        );
        Harness {
            pipeline,
            generator,
            dir,
        }
    }

    fn feedback_entries(h: &Harness) -> Vec<FeedbackEntry> {
        crate::feedback::read_entries(&h.dir.path().join("feedback")).unwrap()
    }

    #[tokio::test]
    async fn concept_regeneration_adds_revisions_with_feedback() {
        let h = harness(
            ScriptedGenerator::new()
                .respond_once(StageHint::Concept, concept_answer("Short vase", "other", 1))
                .respond(StageHint::Concept, concept_answer("Tall vase", "other", 1)),
        );
        let (project, first) = h.pipeline.start("u", "a vase").await.unwrap();
        let first = first.unwrap();
        assert_eq!(first.project.status, ProjectStatus::Pending);

        let second = h
            .pipeline
            .regenerate(project.id, Some("make it taller"))
            .await
            .unwrap();
        match second.artifact {
            StageArtifact::Concept(concept) => {
                assert_eq!(concept.revision, 2);
                assert_eq!(concept.feedback.as_deref(), Some("make it taller"));
            }
            other => panic!("Expected a concept, got {:?}", other),
        }
        let request = h.generator.requests().pop().unwrap();
        assert_eq!(request.context["feedback"], "make it taller");
        assert_eq!(request.context["previous_concept"], "Short vase");
        assert_eq!(second.project.stage, Stage::Concept);
    }

    #[tokio::test]
    async fn unusable_concept_answer_saves_nothing() {
        let h = harness(
            ScriptedGenerator::new()
                .empty_once(StageHint::Concept, "model refused")
                .respond(StageHint::Concept, "no json in this answer"),
        );
        let (project, first) = h.pipeline.start("u", "a widget").await.unwrap();
        assert!(matches!(first, Err(PipelineError::Generation(_))));
        let second = h.pipeline.regenerate(project.id, None).await;
        assert!(matches!(second, Err(PipelineError::Generation(_))));
        assert!(h.pipeline.store().latest_concept(project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generator_outage_leaves_the_stage_untouched() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Cube", "geometric_primitive", 1))
                .fail_once(StageHint::OverallModel, "upstream 503"),
        );
        let (project, _) = h.pipeline.start("u", "a cube").await.unwrap();

        let err = h.pipeline.advance(project.id, Approval::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
        let stored = h.pipeline.store().load_project(project.id).await.unwrap();
        assert_eq!(stored.stage, Stage::Concept);
        assert_eq!(stored.status, ProjectStatus::Pending);
        assert!(stored.approvals.is_empty());
        assert!(
            h.pipeline
                .store()
                .list_units(project.id, None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn failed_overall_model_blocks_advance_until_regenerated() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Cube", "geometric_primitive", 2))
                .respond_once(StageHint::OverallModel, "echo forgot the binding")
                .respond(StageHint::OverallModel, "result=cube"),
        );
        let (project, _) = h.pipeline.start("u", "a cube").await.unwrap();
        let output = h.pipeline.advance(project.id, Approval::default()).await.unwrap();
        assert_eq!(output.project.stage, Stage::OverallModel);
        assert_eq!(output.project.status, ProjectStatus::Failed);

        let err = h.pipeline.advance(project.id, Approval::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let retry = h.pipeline.regenerate(project.id, None).await.unwrap();
        assert_eq!(retry.project.status, ProjectStatus::Pending);
        let units = h
            .pipeline
            .store()
            .list_units(project.id, Some(UnitTarget::OverallModel))
            .await
            .unwrap();
        assert_eq!(units.len(), 2);
        assert!(matches!(units[0].outcome, UnitOutcome::MissingResult { .. }));
        assert_eq!(retry.project.overall_unit_id.as_deref(), Some(units[1].unit_id.as_str()));

        let entries = feedback_entries(&h);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "missing_result");
    }

    #[tokio::test]
    async fn overlapping_regenerations_keep_every_attempt() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Cube", "geometric_primitive", 2))
                .respond(StageHint::OverallModel, "sleep 0.2\nresult=cube"),
        );
        let (project, _) = h.pipeline.start("u", "a cube").await.unwrap();
        h.pipeline.advance(project.id, Approval::default()).await.unwrap();

        let (first, second) = tokio::join!(
            h.pipeline.regenerate(project.id, None),
            h.pipeline.regenerate(project.id, None)
        );
        first.unwrap();
        second.unwrap();

        let units = h
            .pipeline
            .store()
            .list_units(project.id, Some(UnitTarget::OverallModel))
            .await
            .unwrap();
        let attempts: Vec<u32> = units.iter().map(|u| u.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        let mut ids: Vec<&str> = units.iter().map(|u| u.unit_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(units.iter().all(|u| u.outcome == UnitOutcome::Success));
    }

    #[tokio::test]
    async fn parts_flow_with_accept_partial() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Box with lid", "enclosure", 2))
                .respond(StageHint::OverallModel, "result=box")
                .respond(
                    StageHint::Parts,
                    breakdown_answer(&[("Base", "open box"), ("Lid", "flat lid")]),
                )
                .respond(StageHint::Part, "result=part"),
        );
        let (project, _) = h.pipeline.start("u", "a box with a lid").await.unwrap();
        let id = project.id;
        h.pipeline.advance(id, Approval::by("alice")).await.unwrap();
        let parts = h.pipeline.advance(id, Approval::by("alice")).await.unwrap();
        assert_eq!(parts.project.stage, Stage::Parts);
        assert_eq!(parts.project.total_parts, 2);

        // Not in generation yet.
        assert!(h.pipeline.generate_part(id, 1).await.is_err());
        assert!(h.pipeline.accept_partial(id, Approval::default()).await.is_err());

        let generation = h.pipeline.advance(id, Approval::by("alice")).await.unwrap();
        assert_eq!(generation.project.status, ProjectStatus::Generating);

        let report = h.pipeline.generate_part(id, 1).await.unwrap();
        assert!(report.is_completed());

        let done = h.pipeline.accept_partial(id, Approval::by("alice")).await.unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert_eq!((done.generated_parts, done.failed_parts), (1, 1));
        assert_eq!(done.approvals.len(), 4);
        assert_eq!(done.approvals.last().unwrap().to, Stage::Completed);

        let err = h.pipeline.advance(id, Approval::default()).await.unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[tokio::test]
    async fn part_correction_replaces_failure_and_is_logged() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Hinge", "mechanical_system", 2))
                .respond(StageHint::OverallModel, "result=hinge")
                .respond(StageHint::Parts, breakdown_answer(&[("Leaf", "leaf"), ("Pin", "pin")]))
                .respond_matching(StageHint::Part, "pin", "exit 7")
                .respond(StageHint::Part, "result=leaf"),
        );
        let (project, _) = h.pipeline.start("u", "a hinge").await.unwrap();
        let id = project.id;
        for _ in 0..3 {
            h.pipeline.advance(id, Approval::default()).await.unwrap();
        }
        let summary = h.pipeline.generate_all(id).await.unwrap();
        assert_eq!((summary.completed, summary.failed), (1, 1));
        assert!(summary.project_completed);

        let report = h
            .pipeline
            .apply_correction(id, UnitTarget::Part { number: 2 }, "```sh\nresult=pin\n```")
            .await
            .unwrap();
        let unit = report.unit.unwrap();
        assert_eq!(unit.origin, UnitOrigin::Correction);
        assert_eq!(unit.attempt, 2);
        assert_eq!(report.project.stage, Stage::Completed);
        assert_eq!((report.project.generated_parts, report.project.failed_parts), (2, 0));

        let entries = feedback_entries(&h);
        let correction = entries
            .iter()
            .find(|e| e.rating == Some(Rating::Corrected))
            .unwrap();
        assert_eq!(correction.generated_code, "exit 7");
        assert_eq!(correction.corrected_code.as_deref(), Some("result=pin"));
        assert!(correction.success);

        // The approved whole-object model is frozen.
        let err = h
            .pipeline
            .apply_correction(id, UnitTarget::OverallModel, "result=x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn feedback_submission_validates_corrections() {
        let h = harness(
            ScriptedGenerator::new()
                .respond(StageHint::Concept, concept_answer("Ring", "geometric_primitive", 1))
                .respond(StageHint::OverallModel, "result=ring"),
        );
        let (project, _) = h.pipeline.start("u", "a ring").await.unwrap();
        h.pipeline.advance(project.id, Approval::default()).await.unwrap();

        let mut submission = FeedbackSubmission::rating(UnitTarget::OverallModel, Rating::Bad);
        submission.text = Some("too thin".into());
        submission.corrected_code = Some("echo still no binding".into());
        submission.validate = true;
        let entry = h.pipeline.submit_feedback(project.id, submission).await.unwrap();
        assert!(entry.validated);
        assert!(!entry.success);
        assert_eq!(entry.generated_code, "result=ring");
        assert_eq!(entry.correction_type, Some(CorrectionType::CodeFix));

        let good = h
            .pipeline
            .submit_feedback(
                project.id,
                FeedbackSubmission::rating(UnitTarget::OverallModel, Rating::Good),
            )
            .await
            .unwrap();
        assert!(good.success);
        assert_eq!(feedback_entries(&h).len(), 2);

        let missing = h
            .pipeline
            .submit_feedback(
                project.id,
                FeedbackSubmission::rating(UnitTarget::Part { number: 1 }, Rating::Ok),
            )
            .await;
        assert!(matches!(missing, Err(PipelineError::PartNotFound { .. })));
    }
}
