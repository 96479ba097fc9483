//! Browser tools the LLM can call, and their translation into agent commands.

pub mod action;
pub mod browser;
pub mod executor;
pub mod registry;

use async_trait::async_trait;
use relay_core::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

pub use action::{normalize_key_name, BrowserAction};
pub use executor::{ExecutionReport, ToolExecutor, ToolResult};
pub use registry::ToolRegistry;

/// The live browser a tool acts on. Implemented by the server over the hub
/// and by test doubles.
#[async_trait]
pub trait BrowserControl: Send + Sync {
    /// Fire-and-forget delivery of one action to the agent.
    async fn send_action(&self, action: BrowserAction) -> Result<()>;
    /// Current screenshot as a `data:` URI or bare base64.
    async fn screenshot(&self) -> Result<String>;
    async fn page_state(&self) -> Result<Value>;
}

#[derive(Clone)]
pub struct ToolContext {
    pub browser: Arc<dyn BrowserControl>,
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// What a successful tool call hands back to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    /// Short label for the user's action list when `content` is bulky.
    pub summary: Option<String>,
    pub screenshot: Option<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput>;
}

/// Failure text for the model or the user, without the error-kind prefix
/// `Display` adds.
pub fn error_text(err: &Error) -> String {
    match err {
        Error::Tool(msg) | Error::Validation(msg) | Error::Timeout(msg) | Error::Provider(msg) => {
            msg.clone()
        }
        other => other.to_string(),
    }
}
