use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cad_config::{CONFIG_FILE_NAME, CadToml};

pub const DATA_DIR_NAME: &str = ".cadforge";

/// Runtime configuration for cadforge.
///
/// Bridges the layered `CadToml` settings with the on-disk layout of a
/// cadforge project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub output_dir: PathBuf,
    pub feedback_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: CadToml,
}

impl Config {
    /// Resolve a project directory, loading `cadforge.toml` and applying
    /// environment overrides.
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let data_dir = project_dir.join(DATA_DIR_NAME);
        let mut toml = CadToml::load_or_default(&data_dir)?;
        toml.apply_env();
        Ok(Self::from_parts(project_dir, toml, verbose))
    }

    /// Build a config from an already-resolved directory and settings.
    pub fn from_parts(project_dir: PathBuf, toml: CadToml, verbose: bool) -> Self {
        let data_dir = project_dir.join(DATA_DIR_NAME);
        Self {
            store_path: data_dir.join("store.db"),
            output_dir: data_dir.join("outputs"),
            feedback_dir: data_dir.join("feedback"),
            log_dir: data_dir.join("logs"),
            data_dir,
            project_dir,
            verbose,
            toml,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).context("Failed to create output directory")?;
        std::fs::create_dir_all(&self.feedback_dir)
            .context("Failed to create feedback directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Apply CLI overrides on top of file and environment settings.
    pub fn with_overrides(
        mut self,
        exec_timeout: Option<u64>,
        max_parallel: Option<usize>,
    ) -> Self {
        if let Some(secs) = exec_timeout {
            self.toml.executor.timeout_secs = secs;
        }
        if let Some(limit) = max_parallel {
            self.toml.parts.max_parallel = limit;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_paths_in_data_directory() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), false).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.data_dir, root.join(".cadforge"));
        assert_eq!(config.store_path, root.join(".cadforge/store.db"));
        assert_eq!(config.output_dir, root.join(".cadforge/outputs"));
        assert_eq!(config.config_file(), root.join(".cadforge/cadforge.toml"));
        assert!(!config.is_initialized());
    }

    #[test]
    fn test_config_reads_toml_file() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join(".cadforge");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(
            data_dir.join("cadforge.toml"),
            "[parts]\nmax_parallel = 7\n",
        )
        .unwrap();
        let config = Config::new(dir.path(), true).unwrap();
        assert_eq!(config.toml.parts.max_parallel, 7);
        assert!(config.verbose);
        assert!(config.is_initialized());
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), false)
            .unwrap()
            .with_overrides(Some(3), Some(5));
        assert_eq!(config.toml.executor.timeout_secs, 3);
        assert_eq!(config.toml.parts.max_parallel, 5);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.output_dir.exists());
        assert!(config.feedback_dir.exists());
        assert!(config.log_dir.exists());
    }

    #[test]
    fn test_missing_project_dir_is_error() {
        let dir = tempdir().unwrap();
        let result = Config::new(&dir.path().join("nope"), false);
        assert!(result.is_err());
    }
}
