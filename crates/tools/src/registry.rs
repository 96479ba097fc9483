use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::browser::{
    ClickTool, GetPageStateTool, NavigateTool, PressKeyTool, ScrollTool, SelectAllTool,
    TakeScreenshotTool, TypeTextTool,
};
use crate::Tool;

/// Tools offered to the model, in the order they are advertised.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TakeScreenshotTool));
        registry.register(Arc::new(ClickTool));
        registry.register(Arc::new(TypeTextTool));
        registry.register(Arc::new(PressKeyTool));
        registry.register(Arc::new(NavigateTool));
        registry.register(Arc::new(ScrollTool));
        registry.register(Arc::new(SelectAllTool));
        registry.register(Arc::new(GetPageStateTool));
        registry
    }

    /// Add a tool, replacing any existing tool with the same name in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        debug!(name, "Registering tool");
        match self.tools.iter().position(|t| t.schema().name == name) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.schema().name == name)
    }

    pub fn get_tool_schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                let schema = tool.schema();
                json!({
                    "type": "function",
                    "function": {
                        "name": schema.name,
                        "description": schema.description,
                        "parameters": schema.parameters
                    }
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.schema().name.to_string())
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
