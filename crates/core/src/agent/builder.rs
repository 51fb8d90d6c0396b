use std::sync::Arc;

use survey_agent_model::ModelProvider;

use super::{Agent, AgentConfig};
use crate::model_client::ModelClient;
use crate::store::{MemoryStore, SessionStore};
use crate::tool::ToolRegistry;

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    registry: Arc<ToolRegistry>,
    store: Option<Arc<dyn SessionStore>>,
    config: AgentConfig,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            registry: Arc::default(),
            store: None,
            config: AgentConfig::default(),
        }
    }

    /// Sets the tool catalog offered to the model.
    #[inline]
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets where tool runs and tool messages are logged.
    ///
    /// Defaults to a fresh [`MemoryStore`].
    #[inline]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the loop configuration.
    #[inline]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the agent.
    pub fn build(self) -> Agent {
        Agent {
            model_client: self.model_client,
            registry: self.registry,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            config: self.config,
        }
    }
}
