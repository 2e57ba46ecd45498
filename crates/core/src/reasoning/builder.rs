use std::sync::Arc;

use chatloop_model::ModelProvider;

use super::{EventCallback, LoopEvent, ReasoningLoop};
use crate::config::LoopConfig;
use crate::model_client::ModelClient;
use crate::tool::{Tool, Toolbox};

/// [`ReasoningLoop`] builder.
pub struct ReasoningLoopBuilder {
    pub(crate) model_client: ModelClient,
    pub(crate) toolbox: Toolbox,
    pub(crate) config: LoopConfig,
    pub(crate) on_event: Option<EventCallback>,
}

impl ReasoningLoopBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self::with_model_client(ModelClient::new(provider))
    }

    /// Creates a new builder with a preconfigured model client, e.g. one
    /// that retries on rate limiting.
    #[inline]
    pub fn with_model_client(model_client: ModelClient) -> Self {
        Self {
            model_client,
            toolbox: Toolbox::new(),
            config: LoopConfig::default(),
            on_event: None,
        }
    }

    /// Sets the loop configuration.
    #[inline]
    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.toolbox.add_tool(tool);
        self
    }

    /// Replaces the toolbox with a prepared one.
    #[inline]
    pub fn with_toolbox(mut self, toolbox: Toolbox) -> Self {
        self.toolbox = toolbox;
        self
    }

    /// Attaches a callback to be invoked on loop progress.
    ///
    /// The callback may be called from multiple tasks when tool calls run
    /// concurrently, and it should return quickly.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(LoopEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Arc::new(on_event));
        self
    }

    /// Builds the loop.
    #[inline]
    pub fn build(self) -> ReasoningLoop {
        ReasoningLoop::from_builder(self)
    }
}
