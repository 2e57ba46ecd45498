use std::collections::VecDeque;

use chatloop_core::tool::{Tool, Toolbox};
use chatloop_core::{
    CancellationToken, LoopConfig, LoopError, LoopEvent, ModelClient,
    ReasoningLoop, ReasoningLoopBuilder, RunReport, Transcript,
};
use chatloop_model::{ModelMessage, ModelProvider};
use serde::{Deserialize, Serialize};

use crate::tools::*;

/// One finished exchange of a [`ChatSession`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Turn {
    /// What the user asked.
    pub input: String,
    /// The final answer, if the model gave one.
    pub answer: Option<String>,
}

/// A session builder.
///
/// See [`ChatSession`].
pub struct SessionBuilder {
    loop_builder: ReasoningLoopBuilder,
    toolbox: Toolbox,
    system_prompt: Option<String>,
    history_window: Option<usize>,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        Self::with_model_client(ModelClient::new(provider))
    }

    /// Creates a session builder with a preconfigured model client.
    pub fn with_model_client(model_client: ModelClient) -> Self {
        let toolbox = Toolbox::new()
            .with_tool(CalculatorTool::new())
            .with_tool(ClockTool::new());
        Self {
            loop_builder: ReasoningLoopBuilder::with_model_client(model_client),
            toolbox,
            system_prompt: None,
            history_window: None,
        }
    }

    /// Sets the system prompt sent at the start of every turn.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Keeps only the last `turns` exchanges as context for new messages.
    ///
    /// Without a window, the whole history is sent every time.
    #[inline]
    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = Some(turns);
        self
    }

    /// Sets the loop configuration.
    #[inline]
    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.loop_builder = self.loop_builder.with_config(config);
        self
    }

    /// Registers an additional tool. A tool named like a built-in one
    /// replaces it.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.toolbox.add_tool(tool);
        self
    }

    /// Replaces all tools, including the built-in ones.
    #[inline]
    pub fn with_toolbox(mut self, toolbox: Toolbox) -> Self {
        self.toolbox = toolbox;
        self
    }

    /// Attaches a callback to be invoked on loop progress.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(LoopEvent) + Send + Sync + 'static,
    ) -> Self {
        self.loop_builder = self.loop_builder.on_event(on_event);
        self
    }

    /// Builds a new session.
    pub fn build(self) -> ChatSession {
        let reasoning_loop =
            self.loop_builder.with_toolbox(self.toolbox).build();
        ChatSession {
            reasoning_loop,
            system_prompt: self.system_prompt,
            history_window: self.history_window,
            history: VecDeque::new(),
        }
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session owns the conversation history. Every message starts a fresh
/// transcript made of the system prompt, the remembered turns and the new
/// input, and runs one bounded loop over it. Only the input and the final
/// answer of a turn are remembered, intermediate tool traffic is not.
pub struct ChatSession {
    reasoning_loop: ReasoningLoop,
    system_prompt: Option<String>,
    history_window: Option<usize>,
    history: VecDeque<Turn>,
}

impl ChatSession {
    /// Sends a message and waits for the loop to finish.
    ///
    /// The turn is remembered only if the run succeeds.
    #[inline]
    pub async fn send_message(
        &mut self,
        message: &str,
    ) -> Result<RunReport, LoopError> {
        self.send_message_until_cancelled(message, &CancellationToken::new())
            .await
    }

    /// Like [`send_message`](Self::send_message), but stops once `cancel`
    /// fires.
    pub async fn send_message_until_cancelled(
        &mut self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport, LoopError> {
        let mut transcript = self.transcript_for(message);
        let report = self
            .reasoning_loop
            .run_until_cancelled(&mut transcript, cancel)
            .await?;

        debug!(
            "turn finished after {} model calls and {} tool calls",
            report.stats.completion_calls, report.stats.tool_calls
        );
        self.remember(Turn {
            input: message.to_owned(),
            answer: report.result.answer().map(str::to_owned),
        });
        Ok(report)
    }

    /// Returns the remembered turns, oldest first.
    #[inline]
    pub fn history(&self) -> impl ExactSizeIterator<Item = &Turn> {
        self.history.iter()
    }

    /// Forgets all turns.
    #[inline]
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Returns the underlying loop.
    #[inline]
    pub fn reasoning_loop(&self) -> &ReasoningLoop {
        &self.reasoning_loop
    }

    fn transcript_for(&self, message: &str) -> Transcript {
        let mut transcript = match &self.system_prompt {
            Some(prompt) => Transcript::with_system_prompt(prompt.as_str()),
            None => Transcript::new(),
        };
        for turn in &self.history {
            transcript.push_user(turn.input.as_str());
            if let Some(answer) = &turn.answer {
                transcript.push(ModelMessage::assistant(answer.as_str()));
            }
        }
        transcript.push_user(message);
        transcript
    }

    fn remember(&mut self, turn: Turn) {
        self.history.push_back(turn);
        if let Some(window) = self.history_window {
            while self.history.len() > window {
                self.history.pop_front();
            }
        }
    }
}
