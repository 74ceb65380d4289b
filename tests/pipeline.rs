//! End-to-end pipeline scenarios against the SQLite store, a scripted
//! generator and the shell worker runtime.

use cadforge::design::{Approval, DesignPipeline, StageArtifact};
use cadforge::executor::{SandboxedExecutor, ShellRuntime};
use cadforge::feedback::{FeedbackLogger, read_entries};
use cadforge::generator::scripted::{breakdown_answer, concept_answer};
use cadforge::generator::{ScriptedGenerator, StageHint};
use cadforge::parts::OrchestratorSettings;
use cadforge::store::{DesignStore, SqliteStore};
use cadforge::PipelineError;
use cadforge_common::{ExportFormat, PartStatus, ProjectStatus, Stage, UnitOutcome, UnitTarget};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

struct World {
    pipeline: DesignPipeline,
    store: Arc<dyn DesignStore>,
    dir: TempDir,
}

fn executor(timeout: Duration) -> SandboxedExecutor {
    SandboxedExecutor::new(Arc::new(ShellRuntime::new("sh")), timeout, "result")
}

fn world(generator: ScriptedGenerator) -> World {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn DesignStore> =
        Arc::new(SqliteStore::open(&dir.path().join("store.db")).unwrap());
    let pipeline = DesignPipeline::new(
        store.clone(),
        Arc::new(generator),
        Arc::new(executor(Duration::from_secs(10))),
        Arc::new(FeedbackLogger::new(&dir.path().join("feedback"))),
        OrchestratorSettings {
            formats: vec![ExportFormat::Step, ExportFormat::Stl],
            output_root: dir.path().join("outputs"),
            max_parallel: 2,
            accept_partial_export: true,
        },
    );
    World {
        pipeline,
        store,
        dir,
    }
}

/// Create a project and approve stages until it reaches `generation`.
async fn project_in_generation(world: &World, prompt: &str) -> Uuid {
    let (project, concept) = world.pipeline.start("tester", prompt).await.unwrap();
    concept.unwrap();
    for _ in 0..3 {
        world
            .pipeline
            .advance(project.id, Approval::by("tester"))
            .await
            .unwrap();
    }
    project.id
}

#[tokio::test]
async fn test_sphere_completes_directly_after_overall_model() {
    let world = world(
        ScriptedGenerator::new()
            .respond(
                StageHint::Concept,
                concept_answer("Sphere, diameter 40mm", "geometric_primitive", 1),
            )
            .respond(StageHint::OverallModel, "result='sphere radius=20'"),
    );

    let (project, concept) = world
        .pipeline
        .start("tester", "a sphere with diameter 40mm")
        .await
        .unwrap();
    assert!(matches!(concept.unwrap().artifact, StageArtifact::Concept(_)));

    let overall = world
        .pipeline
        .advance(project.id, Approval::by("tester"))
        .await
        .unwrap();
    let StageArtifact::OverallModel(unit) = overall.artifact else {
        panic!("Expected the whole-object model");
    };
    assert_eq!(unit.outcome, UnitOutcome::Success);
    assert_eq!(unit.files.len(), 2);
    let stl = unit.file_for(ExportFormat::Stl).unwrap();
    assert!(stl.path.ends_with(format!("{}.stl", unit.unit_id)));
    let project_dir = world.dir.path().canonicalize().unwrap().join("outputs");
    assert!(stl.path.starts_with(project_dir.join(project.id.to_string())));
    assert_eq!(overall.project.stage, Stage::OverallModel);
    assert_eq!(overall.project.status, ProjectStatus::Pending);

    let done = world
        .pipeline
        .advance(project.id, Approval::by("tester"))
        .await
        .unwrap();
    assert_eq!(done.project.stage, Stage::Completed);
    assert_eq!(done.project.status, ProjectStatus::Completed);
    assert_eq!((done.project.generated_parts, done.project.total_parts), (1, 1));
    let walked: Vec<(Stage, Stage)> = done
        .project
        .approvals
        .iter()
        .map(|a| (a.from, a.to))
        .collect();
    assert_eq!(
        walked,
        vec![
            (Stage::Concept, Stage::OverallModel),
            (Stage::OverallModel, Stage::Parts),
            (Stage::Parts, Stage::Generation),
            (Stage::Generation, Stage::Completed),
        ]
    );

    let breakdown = world.store.load_breakdown(project.id).await.unwrap().unwrap();
    assert_eq!(breakdown.parts[0].current_unit_id.as_deref(), Some(unit.unit_id.as_str()));
    assert_eq!(breakdown.parts[0].status, PartStatus::Completed);
}

#[tokio::test]
async fn test_missing_binding_fails_only_that_part() {
    let world = world(
        ScriptedGenerator::new()
            .respond(StageHint::Concept, concept_answer("Desk lamp", "mechanical_system", 3))
            .respond(StageHint::OverallModel, "result=lamp")
            .respond(
                StageHint::Parts,
                breakdown_answer(&[
                    ("Base", "weighted base"),
                    ("Arm", "articulated arm"),
                    ("Shade", "conical shade"),
                ]),
            )
            .respond_matching(StageHint::Part, "articulated", "arm_shape=built")
            .respond(StageHint::Part, "result=part"),
    );
    let id = project_in_generation(&world, "a desk lamp").await;

    let summary = world.pipeline.generate_all(id).await.unwrap();
    assert_eq!((summary.completed, summary.failed), (2, 1));
    assert!(summary.project_completed);

    let project = world.store.load_project(id).await.unwrap();
    assert_eq!(project.stage, Stage::Completed);
    assert_eq!((project.generated_parts, project.failed_parts), (2, 1));

    let breakdown = world.store.load_breakdown(id).await.unwrap().unwrap();
    let statuses: Vec<PartStatus> = breakdown.parts.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![PartStatus::Completed, PartStatus::Failed, PartStatus::Completed]
    );
    let arm_units = world
        .store
        .list_units(id, Some(UnitTarget::Part { number: 2 }))
        .await
        .unwrap();
    assert!(matches!(arm_units[0].outcome, UnitOutcome::MissingResult { .. }));

    let entries = read_entries(&world.dir.path().join("feedback")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].part_number, Some(2));
    assert_eq!(entries[0].outcome, "missing_result");

    // Completion already fired; a second run changes nothing.
    let again = world.pipeline.generate_all(id).await.unwrap();
    assert_eq!(again.attempted, 0);
    let project = world.store.load_project(id).await.unwrap();
    assert_eq!(project.generated_parts + project.failed_parts, 3);
    assert_eq!(project.approvals.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_parts_do_not_lose_updates() {
    let world = world(
        ScriptedGenerator::new()
            .respond(StageHint::Concept, concept_answer("Two plates", "structural", 2))
            .respond(StageHint::OverallModel, "result=plates")
            .respond(
                StageHint::Parts,
                breakdown_answer(&[("Top", "top plate"), ("Bottom", "bottom plate")]),
            )
            .respond(StageHint::Part, "sleep 0.2\nresult=plate"),
    );
    let id = project_in_generation(&world, "two plates").await;

    let (first, second) = tokio::join!(
        world.pipeline.generate_part(id, 1),
        world.pipeline.generate_part(id, 2)
    );
    assert!(first.unwrap().is_completed());
    assert!(second.unwrap().is_completed());

    let project = world.store.load_project(id).await.unwrap();
    assert_eq!(project.generated_parts, 2);
    assert_eq!(project.failed_parts, 0);
    assert_eq!(project.stage, Stage::Completed);
}

#[tokio::test]
async fn test_stage_skips_are_rejected() {
    let world = world(
        ScriptedGenerator::new()
            .respond(StageHint::Concept, concept_answer("Bracket", "structural", 2))
            .respond(StageHint::OverallModel, "result=bracket")
            .respond(StageHint::Parts, breakdown_answer(&[("A", "a"), ("B", "b")])),
    );
    let (project, _) = world.pipeline.start("tester", "a bracket").await.unwrap();

    // Parts cannot be generated before the breakdown is approved.
    let err = world.pipeline.generate_part(project.id, 1).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    let err = world.pipeline.generate_all(project.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));

    for _ in 0..3 {
        world
            .pipeline
            .advance(project.id, Approval::default())
            .await
            .unwrap();
    }
    // Generation only completes through settled parts.
    let err = world
        .pipeline
        .advance(project.id, Approval::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));

    let stored = world.store.load_project(project.id).await.unwrap();
    assert_eq!(stored.stage, Stage::Generation);
    assert_eq!(stored.status, ProjectStatus::Generating);
}

#[tokio::test]
async fn test_exports_are_deterministic_across_runs() {
    let dir = TempDir::new().unwrap();
    let executor = executor(Duration::from_secs(10));
    let formats = [ExportFormat::Step, ExportFormat::Stl];
    let code = "result='box 10x20x30'";

    let first = executor
        .execute(code, "box_a1", &formats, &dir.path().join("one"))
        .await
        .unwrap();
    let second = executor
        .execute(code, "box_a1", &formats, &dir.path().join("two"))
        .await
        .unwrap();

    assert!(first.is_success() && second.is_success());
    let digests = |r: &cadforge::executor::ExecutionResult| -> Vec<(ExportFormat, String, u64)> {
        r.files
            .iter()
            .map(|f| (f.format, f.sha256.clone(), f.bytes))
            .collect()
    };
    assert_eq!(digests(&first), digests(&second));
}

#[tokio::test]
async fn test_infinite_loop_times_out_promptly() {
    let dir = TempDir::new().unwrap();
    let executor = executor(Duration::from_secs(1));

    let started = Instant::now();
    let result = executor
        .execute("while :; do :; done", "spin_a1", &[ExportFormat::Stl], dir.path())
        .await
        .unwrap();

    assert_eq!(result.outcome, UnitOutcome::Timeout { limit_secs: 1 });
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.files.is_empty());
}
