use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{json, Value};

use super::{Capability, CapabilityMetadata};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

pub const ID: &str = "datetime";

/// Reports the current date and time, optionally shifted to a UTC offset
pub struct DateTimeCapability {
    metadata: CapabilityMetadata,
    tool: Tool,
}

impl Default for DateTimeCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeCapability {
    pub fn new() -> Self {
        Self {
            metadata: CapabilityMetadata::new(ID, "Date & Time")
                .with_description("Tells the assistant the current date and time")
                .with_category("utility")
                .with_icon("clock"),
            tool: Tool::new(
                "get_current_time",
                "Get the current date and time. Use this whenever the answer depends on today's date or the time of day.",
                json!({
                    "type": "object",
                    "required": [],
                    "properties": {
                        "utc_offset_hours": {
                            "type": "number",
                            "description": "Offset from UTC in hours, e.g. -5 or 5.5. Defaults to 0."
                        }
                    }
                }),
            ),
        }
    }
}

#[async_trait]
impl Capability for DateTimeCapability {
    fn metadata(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    fn descriptor(&self) -> &Tool {
        &self.tool
    }

    async fn execute(&self, arguments: Value) -> AgentResult<Vec<Content>> {
        let hours = match arguments.get("utc_offset_hours") {
            None | Some(Value::Null) => 0.0,
            Some(value) => value.as_f64().ok_or_else(|| {
                AgentError::InvalidParameters("utc_offset_hours must be a number".into())
            })?,
        };

        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32).ok_or_else(|| {
            AgentError::InvalidParameters(format!("utc_offset_hours out of range: {}", hours))
        })?;

        let now = Utc::now().with_timezone(&offset);
        Ok(vec![Content::text(format!(
            "{} ({})",
            now.to_rfc3339(),
            now.format("%A, %B %-d %Y, %H:%M")
        ))])
    }
}
