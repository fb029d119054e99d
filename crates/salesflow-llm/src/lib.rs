pub mod openai;
pub mod streaming;

use std::sync::Arc;

use salesflow_core::config::ModelConfig;
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::traits::LlmClient;

pub use openai::OpenAiClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" | "claude" | "bedrock" => {
            Err(SalesflowError::UnsupportedProvider(config.provider.clone()))
        }
        // Everything else speaks the OpenAI chat completions protocol
        _ => Ok(Arc::new(OpenAiClient::new())),
    }
}
