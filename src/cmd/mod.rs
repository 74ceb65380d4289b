//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                      |
//! |--------------|-------------------------------------------------------|
//! | `project`    | `Init`, `New`, `Show`, `List`                         |
//! | `generation` | `Advance`, `Regenerate`, `Generate`, `Accept`, `Execute` |
//! | `feedback`   | `Correct`, `Feedback`                                 |
//! | `config`     | `Config`                                              |

pub mod config;
pub mod feedback;
pub mod generation;
pub mod project;

pub use config::cmd_config;
pub use feedback::{FeedbackArgs, cmd_correct, cmd_feedback};
pub use generation::{cmd_accept, cmd_advance, cmd_execute, cmd_generate, cmd_regenerate};
pub use project::{cmd_init, cmd_list, cmd_new, cmd_show};

use anyhow::{Context, Result, bail};
use cadforge::config::Config;
use cadforge::design::DesignPipeline;
use cadforge::store::{DesignStore, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::Cli;

/// Configuration plus a pipeline over the workspace store.
pub struct Session {
    pub config: Config,
    pub store: Arc<dyn DesignStore>,
    pub pipeline: DesignPipeline,
}

impl Session {
    pub fn open(cli: &Cli, project_dir: &Path) -> Result<Self> {
        Self::open_with(cli, project_dir, None)
    }

    pub fn open_with(cli: &Cli, project_dir: &Path, max_parallel: Option<usize>) -> Result<Self> {
        let config = load_config(cli, project_dir)?.with_overrides(cli.exec_timeout, max_parallel);
        config.ensure_directories()?;
        let store: Arc<dyn DesignStore> = Arc::new(
            SqliteStore::open(&config.store_path).context("Failed to open the design store")?,
        );
        let pipeline = DesignPipeline::from_config(&config, store.clone())?;
        Ok(Self {
            config,
            store,
            pipeline,
        })
    }

    /// Resolve a full project id or a unique prefix of one.
    pub async fn resolve(&self, reference: &str) -> Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference) {
            return Ok(id);
        }
        let needle = reference.trim().to_lowercase();
        if needle.is_empty() {
            bail!("Project id is empty");
        }
        let matches: Vec<Uuid> = self
            .store
            .list_projects()
            .await?
            .into_iter()
            .map(|p| p.id)
            .filter(|id| id.to_string().starts_with(&needle))
            .collect();
        match matches.as_slice() {
            [id] => Ok(*id),
            [] => bail!("No project matches '{}'", reference),
            _ => bail!(
                "'{}' matches {} projects; use a longer prefix",
                reference,
                matches.len()
            ),
        }
    }
}

/// Load the workspace configuration, failing if `cadforge init` never ran.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    let config = Config::new(project_dir, cli.verbose)?;
    if !config.is_initialized() {
        bail!(
            "No cadforge workspace at {}. Run 'cadforge init' first.",
            project_dir.display()
        );
    }
    Ok(config)
}
