use relay_core::types::ToolCallRequest;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::ToolRegistry;
use crate::{error_text, ToolContext};

/// Outcome of one tool call, ready to go back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Everything a batch of tool calls produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub results: Vec<ToolResult>,
    /// Descriptions of the calls that succeeded, for the user's action list.
    pub actions: Vec<String>,
    /// Image from the last `take_screenshot` in the batch.
    pub screenshot: Option<String>,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        Self { registry, ctx }
    }

    pub async fn execute(&self, call: &ToolCallRequest) -> ToolResult {
        self.run(call).await.0
    }

    async fn run(&self, call: &ToolCallRequest) -> (ToolResult, Option<String>, Option<String>) {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "Unknown tool requested");
            let result = ToolResult {
                tool_call_id: call.id.clone(),
                content: format!("未知的工具: {}", call.name),
                is_error: true,
            };
            return (result, None, None);
        };

        debug!(tool = %call.name, id = %call.id, "Executing tool");
        match tool.execute(&self.ctx, call.arguments.clone()).await {
            Ok(output) => {
                let result = ToolResult {
                    tool_call_id: call.id.clone(),
                    content: output.content,
                    is_error: false,
                };
                (result, output.summary, output.screenshot)
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool failed");
                let result = ToolResult {
                    tool_call_id: call.id.clone(),
                    content: error_text(&e),
                    is_error: true,
                };
                (result, None, None)
            }
        }
    }

    /// Run calls sequentially in the order the model issued them.
    pub async fn execute_tool_calls(&self, calls: &[ToolCallRequest]) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for call in calls {
            let (result, summary, screenshot) = self.run(call).await;
            if !result.is_error {
                report
                    .actions
                    .push(summary.unwrap_or_else(|| result.content.clone()));
            }
            if screenshot.is_some() {
                report.screenshot = screenshot;
            }
            report.results.push(result);
        }
        report
    }
}
