pub mod client;
pub mod openai;

use async_trait::async_trait;
use relay_core::types::{ChatMessage, LLMResponse};
use relay_core::Result;
use serde_json::Value;

/// Chat-completion backend driven by the tool loop.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse>;
}

pub use openai::OpenAIProvider;
