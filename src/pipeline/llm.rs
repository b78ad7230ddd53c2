//! Language-model access for the extraction, inference and assistant stages.
//!
//! Stages talk to a [`ChatModel`], not to `edgequake_llm` directly. That keeps
//! prompt assembly and answer parsing testable with scripted models, and it
//! leaves retry policy to the orchestrator: a `ChatModel` makes exactly one
//! attempt per call.

use crate::config::PipelineConfig;
use crate::error::ReceiptError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Why a single model call produced no usable text.
#[derive(Debug, Clone, Error)]
pub enum ModelCallError {
    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Provider(String),

    #[error("model returned an empty response")]
    Empty,
}

/// One request/response exchange with a language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelCallError>;
}

/// [`ChatModel`] over an `edgequake_llm` provider.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl ProviderModel {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.api_timeout(),
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatModel for ProviderModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelCallError> {
        let start = Instant::now();
        let options = self.options();
        let call = self.provider.chat(messages, Some(&options));
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ModelCallError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| ModelCallError::Provider(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.model,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        if response.content.trim().is_empty() {
            return Err(ModelCallError::Empty);
        }
        Ok(response.content)
    }
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReceiptError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve a provider for `model`, from most-specific to least-specific:
///
/// 1. a pre-built provider (`prebuilt`)
/// 2. `config.provider_name`
/// 3. `EDGEQUAKE_LLM_PROVIDER` (+ `EDGEQUAKE_MODEL` when set)
/// 4. `OPENAI_API_KEY` present → OpenAI
/// 5. `ProviderFactory::from_env`
pub fn resolve_provider(
    config: &PipelineConfig,
    prebuilt: Option<&Arc<dyn LLMProvider>>,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    if let Some(provider) = prebuilt {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(prov) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !prov.is_empty() {
            let env_model = std::env::var("EDGEQUAKE_MODEL")
                .ok()
                .filter(|m| !m.is_empty());
            return create_provider(&prov, env_model.as_deref().unwrap_or(model));
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ReceiptError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Build the vision and text models described by `config`.
pub fn models_from_config(
    config: &PipelineConfig,
) -> Result<(Arc<dyn ChatModel>, Arc<dyn ChatModel>), ReceiptError> {
    let vision_provider =
        resolve_provider(config, config.vision_provider.as_ref(), &config.vision_model)?;
    let text_provider =
        resolve_provider(config, config.text_provider.as_ref(), &config.text_model)?;

    let vision: Arc<dyn ChatModel> = Arc::new(ProviderModel::new(
        vision_provider,
        config.vision_model.clone(),
        config,
    ));
    let text: Arc<dyn ChatModel> = Arc::new(ProviderModel::new(
        text_provider,
        config.text_model.clone(),
        config,
    ));
    Ok((vision, text))
}
