//! Gemini `generateContent` client.
//!
//! Sends a single-turn user prompt with a temperature and the configured
//! safety policy, and returns the concatenated text of the first candidate.
//! The API key travels in the `x-goog-api-key` header, never in the URL.

use crate::{Completion, CompletionError, CompletionRequest, SafetySetting};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Public Gemini API host.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Longest upstream error text kept when the body is not structured JSON.
const MAX_ERROR_TEXT: usize = 512;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
    safety_settings: &'a [SafetySetting],
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Completion backend for the Gemini REST API.
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    safety_settings: Vec<SafetySetting>,
}

impl GeminiClient {
    /// Client with the fully permissive safety policy.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            safety_settings: SafetySetting::permissive(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        )
    }
}

impl Completion for GeminiClient {
    fn id(&self) -> &str {
        "gemini"
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = crate::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let body = GenerateRequest {
                contents: vec![Content {
                    role: "user",
                    parts: vec![Part {
                        text: request.prompt,
                    }],
                }],
                generation_config: GenerationConfig {
                    temperature: request.temperature,
                },
                safety_settings: &self.safety_settings,
            };

            debug!(
                model = request.model,
                key = %request.api_key,
                temperature = request.temperature,
                "sending generateContent"
            );

            let response = self
                .client
                .post(self.endpoint(request.model))
                .header("x-goog-api-key", request.api_key.expose())
                .timeout(request.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| transport_error(e, request.timeout))?;

            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| transport_error(e, request.timeout))?;

            if !status.is_success() {
                return Err(CompletionError::Upstream {
                    status: status.as_u16(),
                    message: upstream_message(&bytes),
                });
            }

            let parsed: GenerateResponse = serde_json::from_slice(&bytes)
                .map_err(|e| CompletionError::Decode(e.to_string()))?;
            extract_text(parsed)
        })
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> CompletionError {
    if e.is_timeout() {
        CompletionError::Timeout { after: timeout }
    } else {
        CompletionError::Transport(e.to_string())
    }
}

/// Prefer `error.message` from a Google API error body, else the raw text.
fn upstream_message(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = json["error"]["message"].as_str() {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty response body".to_string();
    }
    text.chars().take(MAX_ERROR_TEXT).collect()
}

fn extract_text(response: GenerateResponse) -> crate::Result<String> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(CompletionError::Blocked(reason));
    };

    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.text)
        .collect();

    if text.is_empty() {
        return Err(CompletionError::Blocked(format!(
            "candidate has no text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}
