use std::time::Duration;

use async_trait::async_trait;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage;
use llm::error::LLMError;
use thiserror::Error;

use rulegate_core::Settings;

use crate::prompt;

/// Why a completion call produced no text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl InvocationError {
    /// Timeouts, throttling and transport errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, InvocationError::Permanent(_))
    }
}

/// Given a prompt and a model identifier, return completion text or fail.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, InvocationError>;
}

fn map_backend(provider: &str) -> Result<LLMBackend, String> {
    match provider {
        "openai" => Ok(LLMBackend::OpenAI),
        "anthropic" => Ok(LLMBackend::Anthropic),
        "google" => Ok(LLMBackend::Google),
        "ollama" => Ok(LLMBackend::Ollama),
        "groq" => Ok(LLMBackend::Groq),
        "mistral" => Ok(LLMBackend::Mistral),
        "deepseek" => Ok(LLMBackend::DeepSeek),
        other => Err(format!("unknown provider: {other}")),
    }
}

fn classify(err: LLMError) -> InvocationError {
    let text = err.to_string();
    match err {
        LLMError::AuthError(_) | LLMError::InvalidRequest(_) => InvocationError::Permanent(text),
        _ => InvocationError::Transient(text),
    }
}

/// Completion service backed by the `llm` crate.
pub struct LlmCompletion {
    provider: String,
    api_key: String,
    region: String,
    max_tokens: u32,
}

impl LlmCompletion {
    pub fn new(settings: &Settings) -> Result<Self, String> {
        map_backend(&settings.provider)?;
        Ok(Self {
            provider: settings.provider.clone(),
            api_key: settings.api_key.clone(),
            region: settings.bedrock_region.clone(),
            max_tokens: 1024,
        })
    }
}

#[async_trait]
impl CompletionService for LlmCompletion {
    async fn complete(&self, model: &str, user_msg: &str) -> Result<String, InvocationError> {
        let backend = map_backend(&self.provider).map_err(InvocationError::Permanent)?;

        tracing::debug!(
            provider = %self.provider,
            model,
            region = %self.region,
            prompt_bytes = user_msg.len(),
            "invoking completion"
        );

        let mut builder = LLMBuilder::new()
            .backend(backend)
            .model(model)
            .max_tokens(self.max_tokens)
            .system(prompt::system_prompt());

        if !self.api_key.is_empty() {
            builder = builder.api_key(&self.api_key);
        }

        let llm = builder
            .build()
            .map_err(|e| InvocationError::Permanent(format!("build LLM: {e}")))?;

        let messages = vec![ChatMessage::user().content(user_msg).build()];

        let response = llm.chat(&messages).await.map_err(classify)?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            Some(_) => Err(InvocationError::Transient("LLM returned empty text".to_string())),
            None => Err(InvocationError::Transient("LLM returned no text".to_string())),
        }
    }
}
