use crate::attempt::{Attempt, outcome_entry};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::executor::SandboxedExecutor;
use crate::feedback::FeedbackLogger;
use crate::generator::{CodeGenerator, GenerationRequest, StageHint, payload};
use crate::store::{DesignStore, PartOutcome};
use cadforge_common::{
    DesignProject, ExportFormat, GeneratedUnit, Part, PartStatus, ProjectStatus, Stage, UnitOrigin,
    UnitOutcome, UnitTarget,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

/// Progress events emitted while parts are generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartEvent {
    /// A batch of parts is about to run.
    Planned { project_id: Uuid, parts: Vec<u32> },
    /// A part was marked generating.
    Started { part_number: u32, name: String },
    /// A part reached a terminal status.
    Settled { report: PartReport },
    /// The batch finished.
    Finished { summary: GenerationSummary },
}

/// What happened to one part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartReport {
    pub part_number: u32,
    pub status: PartStatus,
    pub unit_id: Option<String>,
    pub outcome: Option<UnitOutcome>,
    pub error: Option<String>,
    /// True when this settle flipped the project to `completed`.
    pub completed_project: bool,
}

impl PartReport {
    pub fn is_completed(&self) -> bool {
        self.status == PartStatus::Completed
    }
}

/// Totals for one `generate_all` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Parts skipped because another caller was already generating them.
    pub busy: usize,
    pub errors: Vec<String>,
    pub project_completed: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub formats: Vec<ExportFormat>,
    pub output_root: PathBuf,
    pub max_parallel: usize,
    pub accept_partial_export: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            formats: config.toml.executor.formats.clone(),
            output_root: config.output_dir.clone(),
            max_parallel: config.toml.parts.max_parallel,
            accept_partial_export: config.toml.parts.accept_partial_export,
        }
    }

    pub fn project_dir(&self, project_id: Uuid) -> PathBuf {
        self.output_root.join(project_id.to_string())
    }
}

/// Runs part units against the generator and the executor.
#[derive(Clone)]
pub struct PartOrchestrator {
    store: Arc<dyn DesignStore>,
    generator: Arc<dyn CodeGenerator>,
    executor: Arc<SandboxedExecutor>,
    feedback: Arc<FeedbackLogger>,
    settings: OrchestratorSettings,
    event_tx: Option<mpsc::Sender<PartEvent>>,
}

impl PartOrchestrator {
    pub fn new(
        store: Arc<dyn DesignStore>,
        generator: Arc<dyn CodeGenerator>,
        executor: Arc<SandboxedExecutor>,
        feedback: Arc<FeedbackLogger>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            generator,
            executor,
            feedback,
            settings,
            event_tx: None,
        }
    }

    /// Set an event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PartEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.settings.max_parallel = max_parallel;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn emit_event(&self, event: PartEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    fn check_stage(project: &DesignProject) -> Result<(), PipelineError> {
        if matches!(project.stage, Stage::Generation | Stage::Completed) {
            return Ok(());
        }
        Err(PipelineError::invalid(
            project.stage,
            project.status,
            "parts can only be generated once the part breakdown is approved",
        ))
    }

    /// Generate and execute one part.
    ///
    /// Only precondition violations (unknown project or part, wrong stage, a
    /// part already generating) and store failures are returned as errors;
    /// every generation or execution failure settles the part as `failed`.
    pub async fn generate_part(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<PartReport, PipelineError> {
        let (project, part) = self.claim(project_id, part_number).await?;
        let result = self.run_part(&project, &part).await;
        let report = self.release_on_error(project_id, part_number, result).await?;
        self.emit_event(PartEvent::Settled {
            report: report.clone(),
        })
        .await;
        Ok(report)
    }

    /// Execute caller-supplied source for one part as a new attempt.
    ///
    /// The unit is `None` when the source could not be executed at all; the
    /// part is then failed with the executor's error.
    pub async fn correct_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        source: &str,
    ) -> Result<(PartReport, Option<GeneratedUnit>), PipelineError> {
        let (project, part) = self.claim(project_id, part_number).await?;
        let result = self
            .execute_part(
                &project,
                &part,
                source.to_string(),
                "human correction".to_string(),
                UnitOrigin::Correction,
            )
            .await;
        let (report, unit) = self.release_on_error(project_id, part_number, result).await?;
        self.emit_event(PartEvent::Settled {
            report: report.clone(),
        })
        .await;
        Ok((report, unit))
    }

    /// Check preconditions and mark the part `generating`.
    async fn claim(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<(DesignProject, Part), PipelineError> {
        let project = self.store.load_project(project_id).await?;
        Self::check_stage(&project)?;
        let part = self.store.begin_part(project_id, part_number).await?;
        self.emit_event(PartEvent::Started {
            part_number,
            name: part.name.clone(),
        })
        .await;
        Ok((project, part))
    }

    /// A part must not stay `generating` after a store failure. A part that
    /// already settled keeps its outcome.
    async fn release_on_error<T>(
        &self,
        project_id: Uuid,
        part_number: u32,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            let error = e.to_string();
            tracing::error!(
                project_id = %project_id,
                part_number,
                error = %error,
                "Part generation aborted"
            );
            let released = self
                .store
                .release_part(
                    project_id,
                    part_number,
                    PartOutcome::Failed {
                        unit_id: None,
                        error,
                    },
                )
                .await;
            match released {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(project_id = %project_id, part_number, "Part already settled");
                }
                Err(release_err) => {
                    tracing::error!(error = %release_err, "Could not release part");
                }
            }
        }
        result
    }

    async fn run_part(
        &self,
        project: &DesignProject,
        part: &Part,
    ) -> Result<PartReport, PipelineError> {
        let project_id = project.id;
        let part_number = part.part_number;

        let request = GenerationRequest::new(part.generation_prompt(), StageHint::Part)
            .with_context("project_prompt", project.original_prompt.clone())
            .with_context("part_number", part_number)
            .with_context("part_name", part.name.clone())
            .with_context("manufacturing_method", part.manufacturing_method.as_str())
            .with_context("material", part.material.clone());

        let generated = match self.generator.generate(&request).await {
            Ok(generated) => generated,
            Err(e) => return self.fail_without_unit(project_id, part_number, e.to_string()).await,
        };
        let source = match payload::source_code(&generated) {
            Ok(source) => source,
            Err(e) => return self.fail_without_unit(project_id, part_number, e.to_string()).await,
        };

        let (report, _) = self
            .execute_part(
                project,
                part,
                source,
                generated.description,
                UnitOrigin::Generated,
            )
            .await?;
        Ok(report)
    }

    /// Execute `source` for a claimed part, record the unit and settle the part.
    async fn execute_part(
        &self,
        project: &DesignProject,
        part: &Part,
        source: String,
        description: String,
        origin: UnitOrigin,
    ) -> Result<(PartReport, Option<GeneratedUnit>), PipelineError> {
        let project_id = project.id;
        let part_number = part.part_number;
        let started = Instant::now();

        let target = UnitTarget::Part {
            number: part_number,
        };
        let attempt = Attempt::next(self.store.as_ref(), project, target, origin).await?;
        let output_dir = self.settings.project_dir(project_id);

        let result = match self
            .executor
            .execute(&source, &attempt.unit_id, &self.settings.formats, &output_dir)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let report = self
                    .fail_without_unit(project_id, part_number, e.to_string())
                    .await?;
                return Ok((report, None));
            }
        };

        let unit = attempt.into_unit(source, description, &self.settings.formats, result);
        self.store.record_unit(&unit).await?;

        let accepted = match &unit.outcome {
            UnitOutcome::Success => true,
            UnitOutcome::PartialExport { .. } => self.settings.accept_partial_export,
            _ => false,
        };
        let outcome = if accepted {
            PartOutcome::Completed {
                unit_id: unit.unit_id.clone(),
                files: unit.files.clone(),
                warning: unit.error.clone(),
            }
        } else {
            PartOutcome::Failed {
                unit_id: Some(unit.unit_id.clone()),
                error: unit
                    .error
                    .clone()
                    .unwrap_or_else(|| unit.outcome.summary()),
            }
        };
        let status = outcome.status();
        self.store
            .settle_part(project_id, part_number, outcome)
            .await?;
        let completed_project = self.store.complete_if_settled(project_id).await?;

        // Corrections are logged by the caller with the human's rating.
        if origin == UnitOrigin::Generated && unit.outcome.is_feedback_worthy() {
            let mut entry = outcome_entry(project, &part.generation_prompt(), &unit);
            entry.success = accepted;
            self.feedback.record(&entry);
        }

        tracing::info!(
            project_id = %project_id,
            unit_id = %unit.unit_id,
            part_number,
            outcome = unit.outcome.kind_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Part settled"
        );
        if completed_project {
            tracing::info!(project_id = %project_id, "All parts settled, project completed");
        }

        let report = PartReport {
            part_number,
            status,
            unit_id: Some(unit.unit_id.clone()),
            outcome: Some(unit.outcome.clone()),
            error: unit.error.clone(),
            completed_project,
        };
        Ok((report, Some(unit)))
    }

    /// Settle a part that failed before any unit could be executed.
    async fn fail_without_unit(
        &self,
        project_id: Uuid,
        part_number: u32,
        error: String,
    ) -> Result<PartReport, PipelineError> {
        tracing::warn!(
            project_id = %project_id,
            part_number,
            error = %error,
            "Part failed before execution"
        );
        self.store
            .settle_part(
                project_id,
                part_number,
                PartOutcome::Failed {
                    unit_id: None,
                    error: error.clone(),
                },
            )
            .await?;
        let completed_project = self.store.complete_if_settled(project_id).await?;
        Ok(PartReport {
            part_number,
            status: PartStatus::Failed,
            unit_id: None,
            outcome: None,
            error: Some(error),
            completed_project,
        })
    }

    /// Generate every pending part, at most `max_parallel` at a time.
    ///
    /// Calling this again once nothing is pending is a no-op.
    pub async fn generate_all(&self, project_id: Uuid) -> Result<GenerationSummary, PipelineError> {
        self.generate_matching(project_id, |status| status == PartStatus::Pending)
            .await
    }

    /// Retry every part that has not completed (pending or failed).
    pub async fn retry_unfinished(
        &self,
        project_id: Uuid,
    ) -> Result<GenerationSummary, PipelineError> {
        self.generate_matching(project_id, |status| {
            matches!(status, PartStatus::Pending | PartStatus::Failed)
        })
        .await
    }

    async fn generate_matching<F>(
        &self,
        project_id: Uuid,
        select: F,
    ) -> Result<GenerationSummary, PipelineError>
    where
        F: Fn(PartStatus) -> bool,
    {
        let project = self.store.load_project(project_id).await?;
        Self::check_stage(&project)?;
        let breakdown = self.store.load_breakdown(project_id).await?.ok_or_else(|| {
            PipelineError::invalid(project.stage, project.status, "project has no part breakdown")
        })?;

        let pending: Vec<u32> = breakdown
            .parts
            .iter()
            .filter(|p| select(p.status))
            .map(|p| p.part_number)
            .collect();

        tracing::info!(
            project_id = %project_id,
            pending = pending.len(),
            max_parallel = self.settings.max_parallel,
            "Generating parts"
        );
        self.emit_event(PartEvent::Planned {
            project_id,
            parts: pending.clone(),
        })
        .await;

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut handles = Vec::with_capacity(pending.len());
        for &part_number in &pending {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::invalid(project.stage, project.status, e.to_string()))?;
            let orchestrator = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit; // Hold until complete
                orchestrator.generate_part(project_id, part_number).await
            }));
        }
        let results = join_all(handles).await;

        let mut summary = GenerationSummary::default();
        for (part_number, result) in pending.into_iter().zip(results) {
            match result {
                Ok(Ok(report)) => {
                    summary.attempted += 1;
                    if report.is_completed() {
                        summary.completed += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok(Err(PipelineError::PartBusy { .. })) => summary.busy += 1,
                Ok(Err(e)) => summary.errors.push(format!("part {}: {}", part_number, e)),
                Err(e) => summary
                    .errors
                    .push(format!("part {}: task failed: {}", part_number, e)),
            }
        }

        self.store.complete_if_settled(project_id).await?;
        let project = self.store.load_project(project_id).await?;
        summary.project_completed =
            project.stage == Stage::Completed && project.status == ProjectStatus::Completed;

        self.emit_event(PartEvent::Finished {
            summary: summary.clone(),
        })
        .await;
        Ok(summary)
    }
}
