//! Upstream completion abstraction
//!
//! Defines the `Completion` trait that decouples the dispatcher from the
//! concrete text-generation API. `GeminiClient` implements it against the
//! Gemini `generateContent` endpoint; tests substitute scripted stubs.

pub mod gemini;

pub use gemini::{DEFAULT_BASE_URL, GeminiClient};

use common::ApiKey;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// One completion call, fully specified by the caller.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub api_key: &'a ApiKey,
    pub prompt: &'a str,
    pub temperature: f32,
    /// Upper bound for the whole upstream exchange.
    pub timeout: Duration,
}

/// Content-safety category understood by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
}

/// Blocking threshold for a safety category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: BlockThreshold,
}

impl SafetySetting {
    /// Every category at `BLOCK_NONE`.
    pub fn permissive() -> Vec<SafetySetting> {
        [
            HarmCategory::Harassment,
            HarmCategory::HateSpeech,
            HarmCategory::SexuallyExplicit,
            HarmCategory::DangerousContent,
        ]
        .into_iter()
        .map(|category| SafetySetting {
            category,
            threshold: BlockThreshold::BlockNone,
        })
        .collect()
    }
}

/// Failure of a single completion call. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("upstream timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("response blocked: {0}")]
    Blocked(String),

    #[error("invalid upstream response: {0}")]
    Decode(String),
}

/// Result alias for completion calls.
pub type Result<T> = std::result::Result<T, CompletionError>;

/// Abstraction over the text-generation backend.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Completion>`).
pub trait Completion: Send + Sync {
    /// Identifier for logging (e.g. "gemini").
    fn id(&self) -> &str;

    /// Generate text for `request.prompt`, returning the text or the failure.
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
