use anyhow::{Context, Result};
use cadforge::logging::{self, LogFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cadforge")]
#[command(version, about = "Staged natural-language to CAD design pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub log_format: LogFormat,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Worker timeout in seconds. Overrides cadforge.toml and CADFORGE_EXEC_TIMEOUT.
    #[arg(long, global = true)]
    pub exec_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a cadforge workspace in the project directory
    Init,
    /// Start a design project from a natural-language prompt
    New {
        prompt: String,
        /// Owner recorded on the project and its feedback
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Show a project's stage, artifacts and parts
    Show { project: String },
    /// List projects, newest first
    List,
    /// Approve the current stage and move to the next one
    Advance {
        project: String,
        /// Who approved the stage
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Re-run the current stage
    Regenerate {
        project: String,
        /// Feedback passed to the generator
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Generate parts (all pending parts unless --part is given)
    Generate {
        project: String,
        #[arg(short, long)]
        part: Option<u32>,
        /// Maximum concurrent part workers
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Accept the current part results and complete the project
    Accept {
        project: String,
        #[arg(long)]
        by: Option<String>,
    },
    /// Execute human-corrected source for the whole object or one part
    Correct {
        project: String,
        #[arg(long, conflicts_with = "part", required_unless_present = "part")]
        overall: bool,
        #[arg(long)]
        part: Option<u32>,
        /// File holding the corrected source
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Rate the current unit of the whole object or one part
    Feedback {
        project: String,
        /// good, ok, bad, corrected or failure
        #[arg(short, long)]
        rating: String,
        #[arg(long)]
        part: Option<u32>,
        #[arg(short, long)]
        text: Option<String>,
        /// File holding corrected source
        #[arg(long)]
        corrected: Option<PathBuf>,
        /// Run the corrected source and record whether it works
        #[arg(long, requires = "corrected")]
        validate: bool,
    },
    /// Run a source file through the sandboxed executor
    Execute {
        file: PathBuf,
        #[arg(long, default_value = "adhoc")]
        unit_id: String,
        /// Export format (repeatable); defaults to the configured formats
        #[arg(long = "format")]
        formats: Vec<String>,
        /// Output directory (defaults to .cadforge/outputs/adhoc)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cadforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // File logging only once the workspace exists; `init` must not create it.
    let data_dir = project_dir.join(cadforge::config::DATA_DIR_NAME);
    let log_dir = data_dir.join("logs");
    let _guard = logging::init(
        cli.verbose,
        cli.log_format,
        data_dir.exists().then_some(log_dir.as_path()),
    );

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::New { prompt, user } => cmd::cmd_new(&cli, &project_dir, prompt, user).await?,
        Commands::Show { project } => cmd::cmd_show(&cli, &project_dir, project).await?,
        Commands::List => cmd::cmd_list(&cli, &project_dir).await?,
        Commands::Advance { project, by, note } => {
            cmd::cmd_advance(&cli, &project_dir, project, by.clone(), note.clone()).await?
        }
        Commands::Regenerate { project, feedback } => {
            cmd::cmd_regenerate(&cli, &project_dir, project, feedback.as_deref()).await?
        }
        Commands::Generate {
            project,
            part,
            max_parallel,
        } => cmd::cmd_generate(&cli, &project_dir, project, *part, *max_parallel).await?,
        Commands::Accept { project, by } => {
            cmd::cmd_accept(&cli, &project_dir, project, by.clone()).await?
        }
        Commands::Correct {
            project,
            overall,
            part,
            file,
        } => cmd::cmd_correct(&cli, &project_dir, project, *overall, *part, file).await?,
        Commands::Feedback {
            project,
            rating,
            part,
            text,
            corrected,
            validate,
        } => {
            cmd::cmd_feedback(
                &cli,
                &project_dir,
                project,
                cmd::FeedbackArgs {
                    rating,
                    part: *part,
                    text: text.clone(),
                    corrected: corrected.as_deref(),
                    validate: *validate,
                },
            )
            .await?
        }
        Commands::Execute {
            file,
            unit_id,
            formats,
            output_dir,
        } => {
            cmd::cmd_execute(
                &cli,
                &project_dir,
                file,
                unit_id,
                formats,
                output_dir.as_deref(),
            )
            .await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
