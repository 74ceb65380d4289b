//! Human corrections and ratings.

use anyhow::{Context, Result, bail};
use cadforge::design::FeedbackSubmission;
use cadforge_common::{Rating, UnitTarget};
use console::style;
use std::path::Path;

use super::Session;
use super::project::{print_project, print_unit};
use crate::Cli;

fn target_for(part: Option<u32>) -> UnitTarget {
    part.map_or(UnitTarget::OverallModel, |number| UnitTarget::Part { number })
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub async fn cmd_correct(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    overall: bool,
    part: Option<u32>,
    file: &Path,
) -> Result<()> {
    if overall == part.is_some() {
        bail!("Pass exactly one of --overall or --part");
    }
    let target = target_for(part);
    let code = read_source(file)?;
    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;

    let report = session.pipeline.apply_correction(id, target, &code).await?;
    match &report.unit {
        Some(unit) => print_unit(unit),
        None => println!("{} correction was not executed", style("✗").red()),
    }
    if let Some(error) = &report.error {
        println!(
            "{} {} still fails: {}",
            style("!").yellow(),
            target,
            error.lines().next().unwrap_or_default()
        );
    }
    println!();
    print_project(&report.project);
    Ok(())
}

/// Arguments of `cadforge feedback`.
pub struct FeedbackArgs<'a> {
    pub rating: &'a str,
    pub part: Option<u32>,
    pub text: Option<String>,
    pub corrected: Option<&'a Path>,
    pub validate: bool,
}

pub async fn cmd_feedback(
    cli: &Cli,
    project_dir: &Path,
    reference: &str,
    args: FeedbackArgs<'_>,
) -> Result<()> {
    let rating: Rating = args.rating.parse().map_err(anyhow::Error::msg)?;
    let target = target_for(args.part);
    let corrected_code = args.corrected.map(read_source).transpose()?;

    let session = Session::open(cli, project_dir)?;
    let id = session.resolve(reference).await?;

    let mut submission = FeedbackSubmission::rating(target, rating);
    submission.text = args.text;
    submission.corrected_code = corrected_code;
    submission.validate = args.validate;
    let entry = session.pipeline.submit_feedback(id, submission).await?;

    println!(
        "Recorded {} feedback for {} ({})",
        style(rating).bold(),
        entry.unit_id,
        target
    );
    if entry.corrected_code.is_some() && entry.validated {
        if entry.success {
            println!("{} corrected code runs and exports", style("✓").green());
        } else {
            println!("{} corrected code does not export", style("✗").red());
        }
    }
    Ok(())
}
