//! Layered configuration read from `.cadforge/cadforge.toml`.
//!
//! Settings are merged from:
//! 1. the TOML file (every key optional)
//! 2. environment variables (`CADFORGE_INTERPRETER`, `CADFORGE_GENERATOR_CMD`,
//!    `CADFORGE_EXEC_TIMEOUT`)
//! 3. CLI flags, applied by the caller
//!
//! # Configuration File Format
//!
//! ```toml
//! [generator]
//! kind = "command"
//! command = "cadforge-generator"
//! endpoint = "https://api.openai.com/v1/chat/completions"
//! model = "gpt-4.1-mini"
//! api_key_env = "OPENAI_API_KEY"
//! timeout_secs = 120
//!
//! [executor]
//! runtime = "cadquery"
//! interpreter = "python3"
//! timeout_secs = 60
//! result_binding = "result"
//! formats = ["step", "stl"]
//!
//! [parts]
//! max_parallel = 2
//! accept_partial_export = true
//!
//! [feedback]
//! enabled = true
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use cadforge_common::ExportFormat;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "cadforge.toml";

/// Which adapter talks to the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// External process speaking JSON on stdin/stdout
    #[default]
    Command,
    /// OpenAI-compatible chat completions endpoint
    Http,
}

impl std::fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorKind::Command => write!(f, "command"),
            GeneratorKind::Http => write!(f, "http"),
        }
    }
}

/// Which driver the sandboxed executor writes for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Python driver that exports through CadQuery
    #[default]
    Cadquery,
    /// POSIX shell driver; used for smoke tests and scripted pipelines
    Shell,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Cadquery => write!(f, "cadquery"),
            RuntimeKind::Shell => write!(f, "shell"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cadquery" => Ok(RuntimeKind::Cadquery),
            "shell" | "sh" => Ok(RuntimeKind::Shell),
            _ => anyhow::bail!("Invalid runtime '{}'. Valid values: cadquery, shell", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default)]
    pub kind: GeneratorKind,
    /// Generator command for `kind = "command"`
    #[serde(default = "default_generator_command")]
    pub command: String,
    /// Extra arguments passed to the generator command
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

fn default_generator_command() -> String {
    "cadforge-generator".to_string()
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_generator_timeout() -> u64 {
    120
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::default(),
            command: default_generator_command(),
            args: Vec::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Hard wall-clock limit per worker process
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    /// Name the generated code must bind its result to
    #[serde(default = "default_result_binding")]
    pub result_binding: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<ExportFormat>,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_result_binding() -> String {
    "result".to_string()
}

fn default_formats() -> Vec<ExportFormat> {
    vec![ExportFormat::Step, ExportFormat::Stl]
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            interpreter: default_interpreter(),
            timeout_secs: default_exec_timeout(),
            result_binding: default_result_binding(),
            formats: default_formats(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsSection {
    /// Upper bound on concurrently running part workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Count a partial export as a completed part
    #[serde(default = "default_true")]
    pub accept_partial_export: bool,
}

fn default_max_parallel() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for PartsSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            accept_partial_export: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Root of `cadforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadToml {
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub parts: PartsSection,
    #[serde(default)]
    pub feedback: FeedbackSection,
}

impl CadToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cadforge.toml")
    }

    /// Load from `<data_dir>/cadforge.toml`, or defaults when the file is absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cadforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides through an arbitrary lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(interpreter) = lookup("CADFORGE_INTERPRETER").filter(|v| !v.is_empty()) {
            self.executor.interpreter = interpreter;
        }
        if let Some(command) = lookup("CADFORGE_GENERATOR_CMD").filter(|v| !v.is_empty()) {
            self.generator.command = command;
        }
        if let Some(timeout) = lookup("CADFORGE_EXEC_TIMEOUT") {
            match timeout.trim().parse::<u64>() {
                Ok(secs) => self.executor.timeout_secs = secs,
                Err(_) => tracing::warn!(value = %timeout, "Ignoring invalid CADFORGE_EXEC_TIMEOUT"),
            }
        }
    }

    /// Human-readable problems with the configuration. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.executor.timeout_secs == 0 {
            warnings.push("executor.timeout_secs is 0: every worker would time out".to_string());
        }
        if self.executor.formats.is_empty() {
            warnings.push("executor.formats is empty: nothing would be exported".to_string());
        }
        if self.executor.result_binding.trim().is_empty()
            || !self
                .executor
                .result_binding
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            warnings.push(format!(
                "executor.result_binding '{}' is not a valid identifier",
                self.executor.result_binding
            ));
        }
        if self.parts.max_parallel == 0 {
            warnings.push("parts.max_parallel is 0: parts would never run".to_string());
        }
        if self.generator.timeout_secs == 0 {
            warnings.push("generator.timeout_secs is 0".to_string());
        }
        match self.generator.kind {
            GeneratorKind::Command if self.generator.command.trim().is_empty() => {
                warnings.push("generator.command is empty".to_string());
            }
            GeneratorKind::Http if !self.generator.endpoint.starts_with("http") => {
                warnings.push(format!(
                    "generator.endpoint '{}' is not an http(s) URL",
                    self.generator.endpoint
                ));
            }
            _ => {}
        }

        warnings
    }
}
