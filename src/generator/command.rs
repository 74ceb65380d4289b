use super::{CodeGenerator, GeneratedCode, GenerationRequest};
use crate::cad_config::GeneratorSection;
use crate::errors::GeneratorError;
use crate::util::extract_json_object;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Generator backed by an external program.
///
/// The request is written to the program's stdin as one JSON document; the
/// program answers on stdout with `{"code": "...", "description": "..."}`.
/// A non-zero exit is `Unavailable`, an unusable answer is `EmptyResult`.
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(section: &GeneratorSection) -> Self {
        Self::new(
            section.command.clone(),
            section.args.clone(),
            Duration::from_secs(section.timeout_secs),
        )
    }

    fn parse_answer(stdout: &str) -> Result<GeneratedCode, GeneratorError> {
        let json = extract_json_object(stdout)
            .ok_or_else(|| GeneratorError::empty("generator printed no JSON answer"))?;
        let answer: GeneratedCode = serde_json::from_str(&json)
            .map_err(|e| GeneratorError::empty(format!("generator answer is malformed: {}", e)))?;
        if answer.code.trim().is_empty() {
            return Err(GeneratorError::empty("generator returned blank code"));
        }
        Ok(answer)
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedCode, GeneratorError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| GeneratorError::unavailable(format!("cannot encode request: {}", e)))?;

        tracing::debug!(
            program = %self.program,
            stage = request.stage_hint.as_str(),
            "Calling generator command"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CADFORGE_STAGE", request.stage_hint.as_str())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GeneratorError::unavailable(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        // Feeding stdin and draining stdout share the deadline; a program that
        // never reads its request must not stall the call past it.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A program that ignores stdin may close it early; its answer still counts.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!(error = %e, "Generator closed stdin early");
                }
            }
        };
        let exchange = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match timeout(self.timeout, exchange).await {
            Ok(result) => result.map_err(|e| {
                GeneratorError::unavailable(format!("failed waiting for generator: {}", e))
            })?,
            Err(_) => {
                return Err(GeneratorError::unavailable(format!(
                    "generator timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GeneratorError::unavailable(format!(
                "generator exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Self::parse_answer(&String::from_utf8_lossy(&output.stdout))
    }
}
