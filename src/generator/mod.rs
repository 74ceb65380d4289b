//! Code generator adapter.
//!
//! A single call contract in front of whatever turns natural language into
//! code: `generate(request) -> {code, description}` or a typed failure. The
//! adapter never retries; retry is always a caller decision so a failed
//! attempt is recorded exactly once.
//!
//! For the `concept` and `parts` stages the generator answers with a JSON
//! payload in `code`; [`payload`] turns those into domain records.

pub mod command;
pub mod http;
pub mod payload;
pub mod scripted;

pub use command::CommandGenerator;
pub use http::HttpGenerator;
pub use scripted::ScriptedGenerator;

use crate::cad_config::{GeneratorKind, GeneratorSection};
use crate::errors::GeneratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which pipeline stage a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageHint {
    Concept,
    OverallModel,
    Parts,
    Part,
}

impl StageHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::OverallModel => "overall_model",
            Self::Parts => "parts",
            Self::Part => "part",
        }
    }

    /// Stages whose answer is a JSON document rather than source code.
    pub fn expects_json(&self) -> bool {
        matches!(self, Self::Concept | Self::Parts)
    }
}

impl std::fmt::Display for StageHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub stage_hint: StageHint,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, stage_hint: StageHint) -> Self {
        Self {
            prompt: prompt.into(),
            stage_hint,
            context: serde_json::Map::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedCode, GeneratorError>;
}

/// Build the configured generator.
pub fn from_config(section: &GeneratorSection) -> Result<Arc<dyn CodeGenerator>, GeneratorError> {
    Ok(match section.kind {
        GeneratorKind::Command => Arc::new(CommandGenerator::from_config(section)),
        GeneratorKind::Http => Arc::new(HttpGenerator::from_config(section)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_stage_hint_snake_case() {
        let request = GenerationRequest::new("a cube", StageHint::OverallModel)
            .with_context("concept", "cube with 10mm sides");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stage_hint"], "overall_model");
        assert_eq!(json["context"]["concept"], "cube with 10mm sides");
    }

    #[test]
    fn json_stages() {
        assert!(StageHint::Concept.expects_json());
        assert!(StageHint::Parts.expects_json());
        assert!(!StageHint::Part.expects_json());
    }

    #[test]
    fn from_config_builds_command_generator() {
        let section = GeneratorSection::default();
        assert!(from_config(&section).is_ok());
    }
}
