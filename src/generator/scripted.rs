//! In-memory generator that replays canned answers.
//!
//! Used to drive the pipeline without a model behind it: tests, demos and
//! reproducing a reported failure from its recorded source.

use super::{CodeGenerator, GeneratedCode, GenerationRequest, StageHint};
use crate::errors::GeneratorError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Reply {
    Code(String),
    Unavailable(String),
    Empty(String),
}

#[derive(Debug, Clone)]
struct Rule {
    stage: StageHint,
    needle: Option<String>,
    reply: Reply,
    once: bool,
}

impl Rule {
    fn matches(&self, request: &GenerationRequest) -> bool {
        self.stage == request.stage_hint
            && self
                .needle
                .as_ref()
                .is_none_or(|n| request.prompt.contains(n.as_str()))
    }
}

/// Answers requests from a list of rules.
///
/// A rule matches on stage and, optionally, on a substring of the prompt.
/// One-shot rules are consumed on use and win over repeatable ones.
#[derive(Default)]
pub struct ScriptedGenerator {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, rule: Rule) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(rule);
        }
        self
    }

    /// Always answer `stage` with `code`.
    pub fn respond(self, stage: StageHint, code: impl Into<String>) -> Self {
        self.push(Rule {
            stage,
            needle: None,
            reply: Reply::Code(code.into()),
            once: false,
        })
    }

    /// Answer `stage` with `code` when the prompt contains `needle`.
    pub fn respond_matching(self, stage: StageHint, needle: &str, code: impl Into<String>) -> Self {
        self.push(Rule {
            stage,
            needle: Some(needle.to_string()),
            reply: Reply::Code(code.into()),
            once: false,
        })
    }

    /// Answer the next `stage` request with `code`, then forget the rule.
    pub fn respond_once(self, stage: StageHint, code: impl Into<String>) -> Self {
        self.push(Rule {
            stage,
            needle: None,
            reply: Reply::Code(code.into()),
            once: true,
        })
    }

    /// Fail the next `stage` request as unavailable.
    pub fn fail_once(self, stage: StageHint, message: &str) -> Self {
        self.push(Rule {
            stage,
            needle: None,
            reply: Reply::Unavailable(message.to_string()),
            once: true,
        })
    }

    /// Fail the next `stage` request with an empty result.
    pub fn empty_once(self, stage: StageHint, reason: &str) -> Self {
        self.push(Rule {
            stage,
            needle: None,
            reply: Reply::Empty(reason.to_string()),
            once: true,
        })
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self, stage: StageHint) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.stage_hint == stage)
            .count()
    }

    fn take_reply(&self, request: &GenerationRequest) -> Option<Reply> {
        let mut rules = self.rules.lock().ok()?;
        if let Some(idx) = rules.iter().position(|r| r.once && r.matches(request)) {
            return Some(rules.remove(idx).reply);
        }
        rules
            .iter()
            .find(|r| r.matches(request))
            .map(|r| r.reply.clone())
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedCode, GeneratorError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        match self.take_reply(request) {
            Some(Reply::Code(code)) => Ok(GeneratedCode {
                code,
                description: format!("scripted {} answer", request.stage_hint),
            }),
            Some(Reply::Unavailable(message)) => Err(GeneratorError::unavailable(message)),
            Some(Reply::Empty(reason)) => Err(GeneratorError::empty(reason)),
            None => Err(GeneratorError::unavailable(format!(
                "no scripted answer for stage {}",
                request.stage_hint
            ))),
        }
    }
}

/// Concept answer in the shape the concept stage expects.
pub fn concept_answer(description: &str, design_type: &str, parts: u32) -> String {
    json!({
        "refined_description": description,
        "design_type": design_type,
        "key_features": [],
        "estimated_complexity": if parts <= 1 { "low" } else { "medium" },
        "estimated_parts_count": parts,
    })
    .to_string()
}

/// Breakdown answer listing `(name, description)` pairs.
pub fn breakdown_answer(parts: &[(&str, &str)]) -> String {
    let parts: Vec<_> = parts
        .iter()
        .map(|(name, description)| {
            json!({
                "name": name,
                "description": description,
                "manufacturing_method": "3d_print",
            })
        })
        .collect();
    json!({ "parts": parts }).to_string()
}
