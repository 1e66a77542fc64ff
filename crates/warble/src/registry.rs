use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::capabilities::{Capability, CapabilityMetadata};
use crate::errors::RegistryError;
use crate::models::message::ToolRequest;
use crate::models::tool::{Tool, ToolCall, ToolResult};

/// The capabilities enabled for one turn, indexed by id and by callable name.
///
/// A registry is built fresh for every turn and is read-only once the turn
/// starts, so `execute` can be called from any task without locking.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability. Unavailable capabilities are skipped without error.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let id = capability.metadata().id.clone();
        let name = capability.descriptor().name.clone();

        if !capability.is_available() {
            tracing::debug!(capability = %id, "capability unavailable, not registering");
            return Ok(());
        }
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateCapability(id));
        }
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability(name));
        }

        let index = self.capabilities.len();
        self.capabilities.push(capability);
        self.by_id.insert(id, index);
        self.by_name.insert(name, index);
        Ok(())
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<&Arc<dyn Capability>, RegistryError> {
        self.by_name
            .get(name)
            .map(|&index| &self.capabilities[index])
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Descriptors in registration order
    pub fn list_descriptors(&self) -> Vec<Tool> {
        self.capabilities
            .iter()
            .map(|capability| capability.descriptor().clone())
            .collect()
    }

    pub fn list_metadata(&self) -> Vec<CapabilityMetadata> {
        self.capabilities
            .iter()
            .map(|capability| capability.metadata().clone())
            .collect()
    }

    /// Display name for a callable name, falling back to the name itself
    pub fn display_name(&self, name: &str) -> String {
        self.resolve_by_name(name)
            .map(|capability| capability.metadata().display_name.clone())
            .unwrap_or_else(|_| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Run a call against the capability it names. Every failure, including a
    /// panic inside the capability, comes back as an unsuccessful result.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let capability = match self.resolve_by_name(&call.name) {
            Ok(capability) => Arc::clone(capability),
            Err(e) => return ToolResult::failure(&call.name, e.to_string()),
        };

        let outcome = AssertUnwindSafe(capability.execute(call.arguments.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(content)) => ToolResult::success(&call.name, content),
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                ToolResult::failure(&call.name, e.to_string())
            }
            Err(_) => {
                tracing::error!(tool = %call.name, "tool call panicked");
                ToolResult::failure(
                    &call.name,
                    format!("Tool execution failed: {} stopped unexpectedly", call.name),
                )
            }
        }
    }

    /// Execute a request as produced by a provider, where the call itself may
    /// already be invalid.
    pub async fn execute_request(&self, request: &ToolRequest) -> ToolResult {
        match &request.tool_call {
            Ok(call) => self.execute(call).await,
            Err(e) => ToolResult::failure("invalid_tool_call", e.to_string()),
        }
    }
}
