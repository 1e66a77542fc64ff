pub mod datetime;
pub mod knowledge;
pub mod weather;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{AgentResult, RegistryError};
use crate::models::content::Content;
use crate::models::tool::Tool;
use crate::registry::CapabilityRegistry;

pub use datetime::DateTimeCapability;
pub use knowledge::KnowledgeSearchCapability;
pub use weather::WeatherCapability;

/// Presentation metadata for a capability. Has no effect on orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    /// Unique within a registry
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
}

impl CapabilityMetadata {
    pub fn new<I, N>(id: I, display_name: N) -> Self
    where
        I: Into<String>,
        N: Into<String>,
    {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: String::new(),
            category: "general".to_string(),
            icon: "tool".to_string(),
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category<S: Into<String>>(mut self, category: S) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_icon<S: Into<String>>(mut self, icon: S) -> Self {
        self.icon = icon.into();
        self
    }
}

/// A named unit of functionality the model may call
#[async_trait]
pub trait Capability: Send + Sync {
    fn metadata(&self) -> &CapabilityMetadata;

    /// The schema the model sees. The descriptor name is the callable name.
    fn descriptor(&self) -> &Tool;

    /// A capability that reports false is skipped at registration
    fn is_available(&self) -> bool {
        true
    }

    /// Run the capability. Implementations validate their own arguments and
    /// bound their own running time.
    async fn execute(&self, arguments: Value) -> AgentResult<Vec<Content>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolboxConfig {
    /// Capability ids enabled when a request does not choose its own
    pub enabled: Vec<String>,
    pub weather_host: String,
    pub knowledge_host: Option<String>,
    pub knowledge_top_k: usize,
    /// Upper bound for each outbound call a built-in capability makes
    pub timeout_secs: u64,
}

impl Default for ToolboxConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                datetime::ID.to_string(),
                weather::ID.to_string(),
                knowledge::ID.to_string(),
            ],
            weather_host: weather::DEFAULT_HOST.to_string(),
            knowledge_host: None,
            knowledge_top_k: 4,
            timeout_secs: 20,
        }
    }
}

/// Every capability the process knows how to build. Registries are cut from
/// the toolbox per turn, so one conversation's selection never leaks into
/// another's.
#[derive(Clone, Default)]
pub struct Toolbox {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the built-in capabilities from configuration
    pub fn from_config(config: &ToolboxConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self::new()
            .with_capability(Arc::new(DateTimeCapability::new()))
            .with_capability(Arc::new(WeatherCapability::new(
                &config.weather_host,
                timeout,
            )?))
            .with_capability(Arc::new(KnowledgeSearchCapability::new(
                config.knowledge_host.as_deref(),
                config.knowledge_top_k,
                timeout,
            )?)))
    }

    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Ids of every capability in the toolbox, in insertion order
    pub fn ids(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|capability| capability.metadata().id.clone())
            .collect()
    }

    /// Build a fresh registry holding the enabled capabilities, in the order
    /// they were enabled. Unknown ids are skipped.
    pub fn registry<S: AsRef<str>>(
        &self,
        enabled: &[S],
    ) -> Result<CapabilityRegistry, RegistryError> {
        let mut registry = CapabilityRegistry::new();
        for id in enabled {
            let id = id.as_ref();
            match self.capabilities.iter().find(|c| c.metadata().id == id) {
                Some(capability) => registry.register(Arc::clone(capability))?,
                None => tracing::warn!(capability = %id, "unknown capability enabled, skipping"),
            }
        }
        Ok(registry)
    }
}
