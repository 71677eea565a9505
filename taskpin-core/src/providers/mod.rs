//! LLM provider implementations.
//!
//! Use [`create_provider`] to build the configured provider.

pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use std::sync::Arc;

pub use openai_compat::OpenAiCompatibleProvider;

/// Build the chat-completions provider described by `config`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(
        model = %config.model,
        base_url = %config.base_url,
        "Creating LLM provider"
    );
    Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_uses_configured_model() {
        let cfg = LlmConfig {
            model: "gpt-4o".into(),
            api_key: Some("k".into()),
            ..LlmConfig::default()
        };
        let provider = create_provider(&cfg).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }
}
