//! Transcript-related types.

use std::collections::HashMap;
use std::fmt::{self, Display};

use chatloop_model::{AssistantMessage, ModelMessage};
use serde::{Deserialize, Serialize};

/// The ordered message history of one loop run.
///
/// A transcript only grows: messages can be appended but never removed or
/// rewritten. Create a fresh one per user query (optionally seeded with
/// prior turns), hand it to exactly one loop invocation, then keep or
/// discard it.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<ModelMessage>,
}

impl Transcript {
    /// Creates an empty transcript.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transcript that starts with the given system instructions.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(prompt: S) -> Self {
        Self {
            messages: vec![ModelMessage::system(prompt)],
        }
    }

    /// Appends a message.
    #[inline]
    pub fn push(&mut self, msg: ModelMessage) {
        self.messages.push(msg);
    }

    /// Appends a user input.
    #[inline]
    pub fn push_user<S: Into<String>>(&mut self, input: S) {
        self.push(ModelMessage::user(input));
    }

    /// Returns all messages in order.
    #[inline]
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if the transcript has no messages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&AssistantMessage> {
        self.messages.iter().rev().find_map(|msg| match msg {
            ModelMessage::Assistant(msg) => Some(msg),
            _ => None,
        })
    }

    /// Consumes the transcript and returns its messages.
    #[inline]
    pub fn into_messages(self) -> Vec<ModelMessage> {
        self.messages
    }

    /// Verifies that tool calls and tool results are correlated.
    ///
    /// Every tool call must be answered by exactly one tool result that
    /// comes after it, and every tool result must answer a call issued
    /// earlier in this transcript.
    pub fn check_correlation(&self) -> Result<(), CorrelationError> {
        // Call id -> whether it has been answered.
        let mut calls: HashMap<&str, bool> = HashMap::new();
        let mut order: Vec<&str> = vec![];

        for msg in &self.messages {
            match msg {
                ModelMessage::Assistant(msg) => {
                    for call in &msg.tool_calls {
                        if calls.insert(&call.id, false).is_some() {
                            return Err(CorrelationError::DuplicateCall(
                                call.id.clone(),
                            ));
                        }
                        order.push(&call.id);
                    }
                }
                ModelMessage::Tool(result) => {
                    match calls.get_mut(result.id.as_str()) {
                        None => {
                            return Err(CorrelationError::Orphaned(
                                result.id.clone(),
                            ));
                        }
                        Some(true) => {
                            return Err(CorrelationError::DuplicateResult(
                                result.id.clone(),
                            ));
                        }
                        Some(answered) => *answered = true,
                    }
                }
                _ => {}
            }
        }

        match order.into_iter().find(|id| calls.get(id) == Some(&false)) {
            Some(id) => Err(CorrelationError::Unanswered(id.to_owned())),
            None => Ok(()),
        }
    }
}

impl From<Vec<ModelMessage>> for Transcript {
    #[inline]
    fn from(messages: Vec<ModelMessage>) -> Self {
        Self { messages }
    }
}

impl Extend<ModelMessage> for Transcript {
    #[inline]
    fn extend<T: IntoIterator<Item = ModelMessage>>(&mut self, iter: T) {
        self.messages.extend(iter);
    }
}

/// Describes how a transcript breaks the call/result correlation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CorrelationError {
    /// The same call id was requested twice.
    DuplicateCall(String),
    /// A tool result answers a call that was never issued before it.
    Orphaned(String),
    /// A call was answered more than once.
    DuplicateResult(String),
    /// A call was never answered.
    Unanswered(String),
}

impl Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationError::DuplicateCall(id) => {
                write!(f, "tool call `{id}` was requested twice")
            }
            CorrelationError::Orphaned(id) => {
                write!(f, "tool result `{id}` answers no earlier call")
            }
            CorrelationError::DuplicateResult(id) => {
                write!(f, "tool call `{id}` was answered more than once")
            }
            CorrelationError::Unanswered(id) => {
                write!(f, "tool call `{id}` was never answered")
            }
        }
    }
}

impl std::error::Error for CorrelationError {}
