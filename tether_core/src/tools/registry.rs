use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Tool, ToolDefinition, ToolResult};

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!("Registering tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Run a tool by name. Unknown tools yield an error result.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            warn!("Tool not found: {name}");
            return ToolResult::error(format!("Tool not found: {name}"));
        };
        tool.execute(args).await
    }

    /// Definitions sorted by name, so prompts are stable across runs.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
