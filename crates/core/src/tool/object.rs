use std::pin::Pin;

use chatloop_model::ModelTool;
use serde_json::{Map, Value};
use tracing::Instrument;

use super::{Error, Tool, ToolResult};

pub(crate) type ToolFuture = Pin<Box<dyn Future<Output = ToolResult> + Send>>;

/// Object-safe view of a [`Tool`], with its input type erased.
pub(crate) trait ToolObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn definition(&self) -> ModelTool;

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture;
}

pub(crate) struct ToolObjectImpl<T: Tool>(pub T);

impl<T: Tool> ToolObject for ToolObjectImpl<T> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    fn definition(&self) -> ModelTool {
        ModelTool {
            name: self.0.name().to_owned(),
            description: self.0.description().to_owned(),
            parameters: self.0.parameter_schema().clone(),
        }
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let input: T::Input =
            match serde_json::from_value(Value::Object(arguments)) {
                Ok(input) => input,
                Err(err) => {
                    let reason = format!("{err}");
                    return Box::pin(std::future::ready(ToolResult::Err(
                        Error::invalid_input().with_reason(reason),
                    )));
                }
            };

        let span = debug_span!("tool execute", tool = self.0.name());
        Box::pin(self.0.execute(input).instrument(span))
    }
}
