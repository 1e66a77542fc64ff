use indoc::indoc;
use serde::Serialize;
use std::collections::HashMap;

use crate::capabilities::CapabilityMetadata;
use crate::errors::AgentError;
use crate::prompt_template::load_prompt;
use crate::registry::CapabilityRegistry;
use crate::models::tool::Tool;

const SUMMARY_TEMPLATE: &str = indoc! {"
    {% if tools | length == 0 %}No tools are available in this conversation.{% else %}You can call the following tools:
    {% for tool in tools %}- {{ tool.name }} ({{ tool.display_name }}): {{ tool.description }}
    {% endfor %}{% endif %}"};

#[derive(Debug, Clone, Serialize)]
struct SummaryEntry {
    name: String,
    display_name: String,
    description: String,
}

/// What the model is told it may call during a turn
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Callable schemas for the function calling interface
    pub tools: Vec<Tool>,
    /// Natural language overview of the same tools
    pub summary: String,
    metadata: Vec<CapabilityMetadata>,
}

impl Catalog {
    pub fn build(registry: &CapabilityRegistry) -> Result<Self, AgentError> {
        let tools = registry.list_descriptors();
        let metadata = registry.list_metadata();

        let entries: Vec<SummaryEntry> = tools
            .iter()
            .zip(metadata.iter())
            .map(|(tool, meta)| SummaryEntry {
                name: tool.name.clone(),
                display_name: meta.display_name.clone(),
                description: tool.description.clone(),
            })
            .collect();

        let mut context = HashMap::new();
        context.insert("tools", entries);
        let summary = load_prompt(SUMMARY_TEMPLATE, &context)
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        Ok(Self {
            tools,
            summary: summary.trim_end().to_string(),
            metadata,
        })
    }

    /// Presentation listing of the same capabilities the model is offered
    pub fn listing(&self) -> &[CapabilityMetadata] {
        &self.metadata
    }
}
