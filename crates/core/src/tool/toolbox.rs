use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::ready;
use std::sync::Arc;

use chatloop_model::{ModelTool, ToolCallRequest};

use super::object::{ToolFuture, ToolObject, ToolObjectImpl};
use super::{Error, Tool, ToolResult};

/// A static registry of tools, keyed by name.
///
/// The toolbox is fixed once it is handed to a loop. Tool names are unique:
/// adding a tool whose name is already taken replaces the previous one.
/// Definitions are reported in registration order.
#[derive(Clone, Default)]
pub struct Toolbox {
    tools: Vec<Arc<dyn ToolObject>>,
    index: HashMap<String, usize>,
}

impl Toolbox {
    /// Creates an empty toolbox.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    pub fn add_tool<T: Tool>(&mut self, tool: T) {
        let name = tool.name().to_owned();
        let tool: Arc<dyn ToolObject> = Arc::new(ToolObjectImpl(tool));
        if let Some(&idx) = self.index.get(&name) {
            warn!("tool `{name}` is registered twice, replacing the old one");
            self.tools[idx] = tool;
            return;
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
    }

    /// Registers a tool and returns the toolbox.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.add_tool(tool);
        self
    }

    /// Returns `true` if a tool with the given name is registered.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Returns the declarations of all tools, for sending to the model.
    #[inline]
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    /// Resolves a single tool call request.
    ///
    /// The returned future is independent of the toolbox. A request for a
    /// tool that is not registered resolves to an
    /// [`ErrorKind::UnknownTool`](super::ErrorKind::UnknownTool) error.
    pub fn invoke(
        &self,
        req: &ToolCallRequest,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let tool = self.index.get(&req.name).map(|&idx| &self.tools[idx]);
        let fut: ToolFuture = match tool {
            Some(tool) => {
                trace!(
                    "spawning a tool ({}) with args: {:?}",
                    req.id, req.arguments
                );
                tool.execute(req.arguments.clone())
            }
            None => {
                warn!("tool not found: {}", req.name);
                Box::pin(ready(Err(Error::unknown_tool()
                    .with_reason(format!("`{}` is not registered", req.name)))))
            }
        };
        fut
    }
}

impl Debug for Toolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolbox")
            .field(
                "tools",
                &self.tools.iter().map(|tool| tool.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
