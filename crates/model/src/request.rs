use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::ToolCallRequest;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The transcript so far, in order.
    pub messages: Vec<ModelMessage>,
    /// Tools that are available to the model. An empty list means the
    /// model must answer with text only.
    pub tools: Vec<ModelTool>,
}

/// A complete message in a transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    /// The system instructions.
    System {
        /// Instruction text.
        content: String,
    },
    /// A user input text.
    User {
        /// Input text.
        content: String,
    },
    /// An assistant turn, which may request tools.
    Assistant(AssistantMessage),
    /// A tool call result.
    Tool(ToolCallResult),
}

impl ModelMessage {
    /// Creates a system message.
    #[inline]
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[inline]
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Creates a text-only assistant message.
    #[inline]
    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::Assistant(AssistantMessage {
            content: content.into(),
            tool_calls: vec![],
        })
    }

    /// Creates a tool result message answering the call `id`.
    #[inline]
    pub fn tool_result<I: Into<String>, S: Into<String>>(
        id: I,
        content: S,
    ) -> Self {
        Self::Tool(ToolCallResult {
            id: id.into(),
            content: content.into(),
        })
    }

    /// Returns the text content of the message.
    pub fn content(&self) -> &str {
        match self {
            ModelMessage::System { content } => content,
            ModelMessage::User { content } => content,
            ModelMessage::Assistant(msg) => &msg.content,
            ModelMessage::Tool(result) => &result.content,
        }
    }
}

/// A message produced by the model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// The text content. May be empty when the message only requests
    /// tools.
    pub content: String,
    /// Tool calls requested by the model, in the order they were listed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The result of calling a tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The identifier of the tool call request this result answers.
    pub id: String,
    /// The observation, or the error text if the call failed.
    pub content: String,
}

/// Describes a tool that can be used by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTool {
    /// Name of the tool, unique among the declared tools.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters definition of the tool.
    ///
    /// For most model providers, the parameters should typically be
    /// defined by a [JSON schema](https://json-schema.org/).
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = ModelMessage::tool_result("call_1", "42");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "role": "tool", "id": "call_1", "content": "42" })
        );

        let msg = ModelMessage::assistant("done");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "role": "assistant", "content": "done" })
        );
    }

    #[test]
    fn test_content() {
        assert_eq!(ModelMessage::system("be nice").content(), "be nice");
        assert_eq!(ModelMessage::user("hi").content(), "hi");
        let msg = ModelMessage::Assistant(AssistantMessage {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "1".to_owned(),
                name: "calculator".to_owned(),
                arguments: Default::default(),
            }],
        });
        assert_eq!(msg.content(), "");
    }
}
