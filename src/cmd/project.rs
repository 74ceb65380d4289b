//! Workspace initialization and project inspection commands.

use anyhow::{Context, Result};
use cadforge::cad_config::CadToml;
use cadforge::config::{Config, DATA_DIR_NAME};
use cadforge::design::{StageArtifact, StageOutput};
use cadforge::parts::GenerationSummary;
use cadforge::store::SqliteStore;
use cadforge_common::{
    Concept, DesignProject, GeneratedUnit, PartBreakdown, PartStatus, ProjectStatus, UnitOrigin,
    UnitTarget,
};
use console::style;
use std::path::Path;

use super::Session;
use crate::Cli;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(project_dir.join(DATA_DIR_NAME))
        .context("Failed to create .cadforge directory")?;
    let config = Config::new(project_dir, false)?;
    let was_configured = config.config_file().exists();
    if !was_configured {
        CadToml::default().save(&config.config_file())?;
    }
    config.ensure_directories()?;
    SqliteStore::open(&config.store_path).context("Failed to create the design store")?;

    if was_configured {
        println!(
            "cadforge workspace already initialized at {}",
            config.data_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized cadforge workspace at {}", config.data_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .cadforge/");
    println!("  ├── cadforge.toml  # Generator, executor and parts settings");
    println!("  ├── store.db       # Projects, concepts, breakdowns and units");
    println!("  ├── outputs/       # Exported STEP/STL/DXF files per project");
    println!("  ├── feedback/      # Monthly JSONL feedback logs");
    println!("  └── logs/          # Daily rolling logs");
    println!();
    println!("Next steps:");
    println!("  1. Point [generator] in cadforge.toml at your code generator");
    println!("  2. Run `cadforge new \"<what to design>\"` to start a project");
    println!("  3. Run `cadforge advance <id>` to approve each stage");
    Ok(())
}

pub async fn cmd_new(cli: &Cli, project_dir: &Path, prompt: &str, user: &str) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let (project, output) = session.pipeline.start(user, prompt).await?;
    println!("Created project {}", style(project.id).bold());
    match output {
        Ok(output) => print_stage_output(&output),
        Err(e) => {
            println!(
                "{} Concept generation failed: {}",
                style("✗").red(),
                e
            );
            println!("Retry with `cadforge regenerate {}`.", project.short_id());
        }
    }
    Ok(())
}

pub async fn cmd_list(cli: &Cli, project_dir: &Path) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let projects = session.store.list_projects().await?;
    if projects.is_empty() {
        println!("No projects yet. Run `cadforge new \"<prompt>\"` to start one.");
        return Ok(());
    }
    for project in projects {
        println!(
            "{}  {:<14} {:<10} {}/{}  {}",
            style(project.short_id()).bold(),
            project.stage.as_str(),
            styled_status(project.status),
            project.generated_parts,
            project.total_parts,
            truncate(&project.original_prompt, 60)
        );
    }
    Ok(())
}

pub async fn cmd_show(cli: &Cli, project_dir: &Path, reference: &str) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;
    let project = session.store.load_project(id).await?;
    print_project(&project);

    if let Some(concept) = session.store.latest_concept(id).await? {
        println!();
        print_concept(&concept);
    }
    if let Some(unit_id) = &project.overall_unit_id
        && let Some(unit) = session.store.load_unit(unit_id).await?
    {
        println!();
        println!("{}", style("Whole-object model").bold());
        print_unit(&unit);
    }
    if let Some(breakdown) = session.store.load_breakdown(id).await? {
        println!();
        print_breakdown(&breakdown);
    }

    let history = session.store.list_units(id, None).await?;
    if !history.is_empty() {
        println!();
        println!("{}", style("Attempts").bold());
        for unit in history {
            println!(
                "  {:<28} {:<14} {:<10} {}",
                unit.unit_id,
                target_label(unit.target),
                origin_label(unit.origin),
                unit.outcome.kind_str()
            );
        }
    }

    if !project.approvals.is_empty() {
        println!();
        println!("{}", style("Approvals").bold());
        for approval in &project.approvals {
            println!(
                "  {} → {}  {}{}",
                approval.from,
                approval.to,
                approval.at.format("%Y-%m-%d %H:%M:%S"),
                approval
                    .approved_by
                    .as_deref()
                    .map(|by| format!(" by {}", by))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

// ── Rendering ────────────────────────────────────────────────────────────

pub(crate) fn styled_status(status: ProjectStatus) -> String {
    let text = format!("{:<10}", status.as_str());
    match status {
        ProjectStatus::Completed => style(text).green().to_string(),
        ProjectStatus::Failed => style(text).red().to_string(),
        ProjectStatus::Generating => style(text).yellow().to_string(),
        _ => text,
    }
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}

fn origin_label(origin: UnitOrigin) -> &'static str {
    match origin {
        UnitOrigin::Generated => "generated",
        UnitOrigin::Correction => "correction",
    }
}

fn target_label(target: UnitTarget) -> String {
    match target {
        UnitTarget::OverallModel => "overall".to_string(),
        UnitTarget::Part { number } => format!("part {}", number),
    }
}

pub(crate) fn print_project(project: &DesignProject) {
    println!("{} {}", style("Project").bold(), project.id);
    println!("  prompt:  {}", project.original_prompt);
    println!("  user:    {}", project.user_id);
    println!(
        "  stage:   {} ({})",
        style(project.stage).cyan(),
        styled_status(project.status).trim_end()
    );
    if project.total_parts > 0 {
        println!(
            "  parts:   {} generated, {} failed, {} total",
            project.generated_parts, project.failed_parts, project.total_parts
        );
    }
}

fn print_concept(concept: &Concept) {
    println!(
        "{} (revision {})",
        style("Concept").bold(),
        concept.revision
    );
    println!("  {}", concept.refined_description);
    println!(
        "  type: {}, complexity: {}, estimated parts: {}",
        concept.design_type.as_str(),
        concept.complexity.as_str(),
        concept.estimated_parts_count
    );
    if !concept.key_features.is_empty() {
        println!("  features: {}", concept.key_features.join(", "));
    }
}

pub(crate) fn print_unit(unit: &GeneratedUnit) {
    let marker = if unit.outcome.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "  {} {} [{}] {} in {}ms",
        marker,
        unit.unit_id,
        unit.outcome.kind_str(),
        origin_label(unit.origin),
        unit.duration_ms
    );
    for file in &unit.files {
        println!(
            "    {} ({} bytes, sha256 {})",
            file.path.display(),
            file.bytes,
            &file.sha256[..file.sha256.len().min(12)]
        );
    }
    if let Some(error) = &unit.error {
        for line in error.lines().take(8) {
            println!("    {}", style(line).dim());
        }
    }
}

fn print_breakdown(breakdown: &PartBreakdown) {
    println!(
        "{} (revision {}, {} parts)",
        style("Parts").bold(),
        breakdown.revision,
        breakdown.len()
    );
    for part in &breakdown.parts {
        let status = match part.status {
            PartStatus::Completed => style(part.status.as_str()).green(),
            PartStatus::Failed => style(part.status.as_str()).red(),
            PartStatus::Generating => style(part.status.as_str()).yellow(),
            PartStatus::Pending => style(part.status.as_str()).dim(),
        };
        println!(
            "  {:>2}. {:<24} {:<8} {:<10} {}",
            part.part_number,
            truncate(&part.name, 24),
            part.manufacturing_method.as_str(),
            status,
            part.current_unit_id.as_deref().unwrap_or("-")
        );
        if let Some(error) = part.error.as_deref().and_then(|e| e.lines().next()) {
            println!("      {}", style(error).dim());
        }
    }
    let methods: Vec<String> = breakdown
        .count_by_method()
        .iter()
        .map(|(method, count)| format!("{} {}", count, method))
        .collect();
    println!("  by method: {}", methods.join(", "));
}

pub(crate) fn print_summary(summary: &GenerationSummary) {
    println!(
        "Attempted {} part(s): {} completed, {} failed",
        summary.attempted,
        style(summary.completed).green(),
        style(summary.failed).red()
    );
    if summary.busy > 0 {
        println!("{} part(s) were already generating elsewhere", summary.busy);
    }
    for error in &summary.errors {
        println!("  {} {}", style("!").yellow(), error);
    }
    if summary.project_completed {
        println!("{}", style("Project completed.").green().bold());
    }
}

pub(crate) fn print_stage_output(output: &StageOutput) {
    match &output.artifact {
        StageArtifact::Concept(concept) => print_concept(concept),
        StageArtifact::OverallModel(unit) => {
            println!("{}", style("Whole-object model").bold());
            print_unit(unit);
        }
        StageArtifact::Breakdown(breakdown) => print_breakdown(breakdown),
        StageArtifact::Parts(summary) => print_summary(summary),
        StageArtifact::Entered => {}
    }
    println!();
    println!(
        "Project {} is at {} ({})",
        output.project.short_id(),
        style(output.project.stage).cyan(),
        styled_status(output.project.status).trim_end()
    );
}
