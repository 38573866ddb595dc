//! Generation provider: repository summary + instruction in, patch out.
//!
//! `OpenAiProvider` talks to any OpenAI-compatible chat-completions
//! endpoint and asks for a JSON list of file transformations.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::analysis::RepositorySummary;
use super::patch::{FileChange, PatchDescription};
use crate::config::ProviderConfig;
use crate::errors::ProviderError;
use crate::util::{extract_json_object, truncate};

/// Produces a patch for an instruction. Implementations are interchangeable
/// (real API client, test stubs).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        summary: &RepositorySummary,
        instruction: &str,
        credential: &SecretString,
    ) -> Result<PatchDescription, ProviderError>;
}

const SYSTEM_PROMPT: &str = "You are an expert software engineer. Create precise, working code \
transformations based on user requests. Always respond with valid JSON.";

const RESPONSE_FORMAT: &str = r#"Create specific code transformations in JSON format:
{
    "transformations": [
        {
            "file_path": "path/relative/to/repository/root",
            "operation": "create|modify|delete",
            "content": "full new file content (for create/modify)",
            "description": "explanation"
        }
    ]
}"#;

pub fn build_prompt(summary: &RepositorySummary, instruction: &str) -> String {
    format!(
        "{}\nUser Request: {}\n\n{}",
        summary.render(),
        instruction,
        RESPONSE_FORMAT
    )
}

#[derive(Deserialize)]
struct Transformation {
    file_path: String,
    operation: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Turn a model reply into a patch.
///
/// Accepts the `{"transformations": [...]}` shape, or a bare object
/// mapping paths to new content (`null` meaning delete).
pub fn parse_patch(reply: &str) -> Result<PatchDescription, ProviderError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| ProviderError::Malformed("no JSON object in reply".into()))?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let mut patch = PatchDescription::new();
    match value.get("transformations") {
        Some(list) => {
            let items: Vec<Transformation> = serde_json::from_value(list.clone())
                .map_err(|e| ProviderError::Malformed(format!("bad transformations: {}", e)))?;
            for item in items {
                let change = match item.operation.to_ascii_lowercase().as_str() {
                    "create" | "modify" => FileChange::Write(item.content.ok_or_else(|| {
                        ProviderError::Malformed(format!("{}: missing content", item.file_path))
                    })?),
                    "delete" => FileChange::Delete,
                    other => {
                        return Err(ProviderError::Malformed(format!(
                            "{}: unknown operation '{}'",
                            item.file_path, other
                        )));
                    }
                };
                if let Some(description) = &item.description {
                    tracing::debug!(path = %item.file_path, "{}", description);
                }
                patch
                    .insert(item.file_path, change)
                    .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            }
        }
        None => {
            let map = value
                .as_object()
                .ok_or_else(|| ProviderError::Malformed("expected a JSON object".into()))?;
            for (path, content) in map {
                let change = match content {
                    serde_json::Value::String(s) => FileChange::Write(s.clone()),
                    serde_json::Value::Null => FileChange::Delete,
                    _ => {
                        return Err(ProviderError::Malformed(format!(
                            "{}: content must be a string or null",
                            path
                        )));
                    }
                };
                patch
                    .insert(path.clone(), change)
                    .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            }
        }
    }
    if patch.is_empty() {
        return Err(ProviderError::Malformed("reply contained no changes".into()));
    }
    Ok(patch)
}

pub struct OpenAiProvider {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn map_http_error(status: StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or_else(|_| truncate(body, 300).to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        _ => ProviderError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    async fn generate(
        &self,
        summary: &RepositorySummary,
        instruction: &str,
        credential: &SecretString,
    ) -> Result<PatchDescription, ProviderError> {
        let prompt = build_prompt(summary, instruction);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        tracing::info!(model = %self.model, prompt_bytes = prompt.len(), "requesting patch");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("unreadable completion: {}", e)))?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("completion had no content".into()))?;
        let patch = parse_patch(&reply)?;
        tracing::info!(files = patch.len(), "patch received");
        Ok(patch)
    }
}
