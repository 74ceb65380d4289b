//! Stage approval, regeneration, part generation and ad-hoc execution.

use anyhow::{Context, Result, bail};
use cadforge::design::Approval;
use cadforge::executor::SandboxedExecutor;
use cadforge::parts::PartEvent;
use cadforge_common::ExportFormat;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::sync::mpsc;

use super::project::{print_stage_output, print_summary};
use super::{Session, load_config};
use crate::Cli;

pub async fn cmd_advance(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    by: Option<String>,
    note: Option<String>,
) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;
    let approval = Approval {
        approved_by: by,
        note,
    };
    let output = session.pipeline.advance(id, approval).await?;
    print_stage_output(&output);
    Ok(())
}

pub async fn cmd_regenerate(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    feedback: Option<&str>,
) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;
    let output = session.pipeline.regenerate(id, feedback).await?;
    print_stage_output(&output);
    Ok(())
}

pub async fn cmd_accept(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    by: Option<String>,
) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;
    let approval = Approval {
        approved_by: by,
        note: Some("partial result accepted".to_string()),
    };
    let project = session.pipeline.accept_partial(id, approval).await?;
    println!(
        "Project {} is at {} with {} of {} parts generated",
        project.short_id(),
        style(project.stage).cyan(),
        project.generated_parts,
        project.total_parts
    );
    Ok(())
}

pub async fn cmd_generate(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    part: Option<u32>,
    max_parallel: Option<usize>,
) -> Result<()> {
    let session = Session::open_with(cli, project_dir, max_parallel)?;
    let id = session.resolve(reference).await?;

    if let Some(part_number) = part {
        let report = session.pipeline.generate_part(id, part_number).await?;
        let marker = if report.is_completed() {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "{} part {} {} ({})",
            marker,
            report.part_number,
            report.status,
            report.unit_id.as_deref().unwrap_or("no unit")
        );
        if let Some(error) = &report.error {
            println!("  {}", style(error.lines().next().unwrap_or_default()).dim());
        }
        if report.completed_project {
            println!("{}", style("Project completed.").green().bold());
        }
        return Ok(());
    }

    let (tx, rx) = mpsc::channel(64);
    let pipeline = session.pipeline.with_part_events(tx);
    let render = tokio::spawn(render_progress(rx));
    let result = pipeline.generate_all(id).await;
    // Closes the event channel so the renderer finishes.
    drop(pipeline);
    render.await.ok();

    print_summary(&result?);
    Ok(())
}

async fn render_progress(mut rx: mpsc::Receiver<PartEvent>) {
    let style_result = ProgressStyle::default_bar()
        .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("█▓▒░"));
    let bar = ProgressBar::new(0);
    if let Ok(bar_style) = style_result {
        bar.set_style(bar_style);
    }
    bar.set_prefix("Parts");

    while let Some(event) = rx.recv().await {
        match event {
            PartEvent::Planned { parts, .. } => {
                bar.set_length(parts.len() as u64);
                bar.enable_steady_tick(std::time::Duration::from_millis(100));
            }
            PartEvent::Started { part_number, name } => {
                bar.set_message(format!("{} {}", style(part_number).yellow(), name));
            }
            PartEvent::Settled { report } => {
                let marker = if report.is_completed() {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                bar.println(format!(
                    "  {} part {} {}",
                    marker,
                    report.part_number,
                    report
                        .error
                        .as_deref()
                        .and_then(|e| e.lines().next())
                        .unwrap_or_default()
                ));
                bar.inc(1);
            }
            PartEvent::Finished { .. } => {
                bar.finish_and_clear();
            }
        }
    }
    if !bar.is_finished() {
        bar.finish_and_clear();
    }
}

pub async fn cmd_execute(
    cli: &Cli,
    project_dir: &Path,
    file: &Path,
    unit_id: &str,
    formats: &[String],
    output_dir: Option<&Path>,
) -> Result<()> {
    let config = load_config(cli, project_dir)?.with_overrides(cli.exec_timeout, None);
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let formats: Vec<ExportFormat> = if formats.is_empty() {
        config.toml.executor.formats.clone()
    } else {
        formats
            .iter()
            .map(|f| f.parse::<ExportFormat>())
            .collect::<Result<_, _>>()
            .map_err(anyhow::Error::msg)?
    };
    if formats.is_empty() {
        bail!("No export formats configured");
    }

    let output_dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => config.output_dir.join("adhoc"),
    };
    let executor = SandboxedExecutor::from_config(&config.toml.executor);
    let result = executor
        .execute(&source, unit_id, &formats, &output_dir)
        .await?;

    let marker = if result.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "{} {} [{}] via {} in {}ms",
        marker,
        result.unit_id,
        result.outcome.kind_str(),
        executor.runtime_name(),
        result.duration.as_millis()
    );
    for exported in &result.files {
        println!(
            "  {} {} ({} bytes)",
            exported.format,
            exported.path.display(),
            exported.bytes
        );
    }
    if let Some(error) = result.error_text() {
        for line in error.lines().take(12) {
            println!("  {}", style(line).dim());
        }
    }
    if !result.is_success() {
        bail!("Execution failed: {}", result.outcome.kind_str());
    }
    Ok(())
}
