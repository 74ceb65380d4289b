use super::{CodeGenerator, GeneratedCode, GenerationRequest, StageHint};
use crate::cad_config::GeneratorSection;
use crate::errors::GeneratorError;
use crate::util::strip_code_fence;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Generator behind an OpenAI-compatible chat completions endpoint.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Output contract for each stage. Only the shape of the answer is fixed
/// here; the caller's prompt is passed through untouched.
fn output_contract(stage: StageHint) -> &'static str {
    match stage {
        StageHint::Concept => {
            "Answer with one JSON object only: {\"refined_description\": string, \
             \"design_type\": string, \"key_features\": [string], \
             \"estimated_complexity\": \"low\"|\"medium\"|\"high\", \
             \"estimated_parts_count\": integer}"
        }
        StageHint::Parts => {
            "Answer with one JSON object only: {\"parts\": [{\"name\": string, \
             \"description\": string, \"manufacturing_method\": \"3d_print\"|\"cnc\", \
             \"material_recommendation\": string, \
             \"estimated_dimensions\": {\"x\": number, \"y\": number, \"z\": number}, \
             \"notes\": string}]}"
        }
        StageHint::OverallModel | StageHint::Part => {
            "Answer with CadQuery Python code only. Bind the final shape to a variable \
             named `result`."
        }
    }
}

impl HttpGenerator {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::unavailable(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(section: &GeneratorSection) -> Result<Self, GeneratorError> {
        let api_key = std::env::var(&section.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %section.api_key_env, "No API key set for HTTP generator");
        }
        Self::new(
            &section.endpoint,
            &section.model,
            api_key,
            Duration::from_secs(section.timeout_secs),
        )
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut user = request.prompt.clone();
        if !request.context.is_empty() {
            user.push_str("\n\nContext:\n");
            user.push_str(
                &serde_json::to_string_pretty(&request.context).unwrap_or_default(),
            );
        }
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": output_contract(request.stage_hint)},
                {"role": "user", "content": user},
            ],
        })
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedCode, GeneratorError> {
        let mut builder = self.client.post(&self.endpoint).json(&self.build_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GeneratorError::unavailable(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::unavailable(format!(
                "endpoint returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::unavailable(format!("unreadable response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let code = if request.stage_hint.expects_json() {
            content.trim().to_string()
        } else {
            strip_code_fence(&content)
        };
        if code.is_empty() {
            return Err(GeneratorError::empty("endpoint returned no content"));
        }

        Ok(GeneratedCode {
            code,
            description: String::new(),
        })
    }
}
