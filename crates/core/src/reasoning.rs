mod builder;
mod error;
mod state;
#[cfg(test)]
mod tests;

use std::future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chatloop_model::{
    AssistantMessage, ModelMessage, ModelRequest, ModelTool, ToolCallRequest,
};
use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use builder::ReasoningLoopBuilder;
pub use error::LoopError;
pub use state::{LoopEvent, LoopResult, LoopState, RunReport, RunStats};

use crate::config::LoopConfig;
use crate::model_client::ModelClient;
use crate::tool::{Error as ToolError, Toolbox};
use crate::transcript::Transcript;

pub(crate) type EventCallback = Arc<dyn Fn(LoopEvent) + Send + Sync>;

/// A bounded request/act/observe cycle.
///
/// Each run asks the model for the next step, resolves the tool calls it
/// requests, appends their observations and asks again, until the model
/// answers without tools or the iteration budget is used up. In the latter
/// case one more model call is made, with no tools declared, to force a
/// best-effort answer.
///
/// The loop itself holds only immutable configuration. Every run owns its
/// transcript and counters, so one loop can serve concurrent runs.
///
/// Tool failures, including calls to unknown tools, are recorded as
/// observations and never end a run. A failing model call ends the run
/// with [`LoopError::Completion`] and is not retried here; configure
/// retries on the [`ModelClient`] instead.
pub struct ReasoningLoop {
    model_client: ModelClient,
    toolbox: Toolbox,
    config: LoopConfig,
    on_event: Option<EventCallback>,
}

impl ReasoningLoop {
    fn from_builder(builder: ReasoningLoopBuilder) -> Self {
        let ReasoningLoopBuilder {
            model_client,
            toolbox,
            config,
            on_event,
        } = builder;
        Self {
            model_client,
            toolbox,
            config,
            on_event,
        }
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Returns the registered tools.
    #[inline]
    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Runs the loop on `transcript` until it reaches a terminal state.
    ///
    /// The transcript should end with the user question. Messages are only
    /// ever appended to it.
    #[inline]
    pub async fn run(
        &self,
        transcript: &mut Transcript,
    ) -> Result<RunReport, LoopError> {
        self.run_until_cancelled(transcript, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops with [`LoopError::Cancelled`]
    /// once `cancel` fires.
    ///
    /// Cancellation is checked at the top of every iteration and also
    /// interrupts a pending model call. Tool calls of an iteration are
    /// always resolved, so the transcript never ends with an unanswered
    /// tool call because of cancellation.
    pub async fn run_until_cancelled(
        &self,
        transcript: &mut Transcript,
        cancel: &CancellationToken,
    ) -> Result<RunReport, LoopError> {
        let deadline =
            self.config.run_timeout.map(|limit| Instant::now() + limit);
        let mut run = Run {
            owner: self,
            transcript,
            cancel,
            deadline,
            stats: RunStats::default(),
        };
        run.drive().instrument(debug_span!("reasoning loop")).await
    }

    fn invoke_tool(
        &self,
        call: &ToolCallRequest,
    ) -> impl Future<Output = String> + Send + 'static {
        // Tools may panic while building their future as well as while
        // polling it.
        let fut = match panic::catch_unwind(AssertUnwindSafe(|| {
            self.toolbox.invoke(call)
        })) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().left_future(),
            Err(payload) => future::ready(Err(payload)).right_future(),
        };
        let tool_timeout = self.config.tool_timeout;
        let on_event = self.on_event.clone();
        let id = call.id.clone();
        let name = call.name.clone();

        async move {
            emit(&on_event, LoopEvent::ToolStarted {
                id: id.clone(),
                name: name.clone(),
            });

            let outcome = match tool_timeout {
                Some(limit) => timeout(limit, fut).await.unwrap_or_else(|_| {
                    Ok(Err(ToolError::timeout().with_reason(format!(
                        "`{name}` did not finish within {limit:?}"
                    ))))
                }),
                None => fut.await,
            };
            let result = outcome.unwrap_or_else(|_| {
                Err(ToolError::execution_error()
                    .with_reason(format!("`{name}` panicked")))
            });

            let is_error = result.is_err();
            let observation = match result {
                Ok(output) => {
                    debug!("tool `{name}` ({id}) succeeded");
                    output
                }
                Err(err) => {
                    warn!("tool `{name}` ({id}) failed: {err}");
                    format!("Error: {err}")
                }
            };

            emit(&on_event, LoopEvent::ToolFinished { id, name, is_error });
            observation
        }
    }
}

/// The state owned by a single run.
struct Run<'a> {
    owner: &'a ReasoningLoop,
    transcript: &'a mut Transcript,
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
    stats: RunStats,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<RunReport, LoopError> {
        let tools = self.owner.toolbox.definitions();
        let max_iterations = self.owner.config.max_iterations.get();

        for iteration in 1..=max_iterations {
            self.stats.iterations = iteration;
            self.check_interrupted()?;
            debug!("iteration {iteration}/{max_iterations}");
            self.emit_state(LoopState::AwaitingModel);

            let msg = self.complete(tools.clone()).await?;
            if msg.tool_calls.is_empty() {
                let answer = msg.content.clone();
                self.transcript.push(ModelMessage::Assistant(msg));
                self.emit_state(LoopState::Done);
                return Ok(self.report(LoopResult::Done(answer)));
            }

            let tool_calls = msg.tool_calls.clone();
            self.transcript.push(ModelMessage::Assistant(msg));
            self.emit_state(LoopState::DispatchingTools);

            let observations = self.dispatch(&tool_calls).await;
            for (call, observation) in tool_calls.into_iter().zip(observations)
            {
                self.transcript
                    .push(ModelMessage::tool_result(call.id, observation));
            }
        }

        info!("iteration budget ({max_iterations}) exhausted, forcing an answer");
        self.check_interrupted()?;
        self.emit_state(LoopState::BudgetExhausted);

        let instruction = self.owner.config.budget_instruction.clone();
        self.transcript.push_user(instruction);
        let msg = self.complete(vec![]).await?;
        if !msg.tool_calls.is_empty() {
            // Recording these would leave unanswered calls behind.
            warn!(
                "discarding {} tool calls requested after the budget ran out",
                msg.tool_calls.len()
            );
        }
        let answer =
            (!msg.content.trim().is_empty()).then(|| msg.content.clone());
        self.transcript.push(ModelMessage::assistant(msg.content));
        Ok(self.report(LoopResult::BudgetExhausted(answer)))
    }

    async fn complete(
        &mut self,
        tools: Vec<ModelTool>,
    ) -> Result<AssistantMessage, LoopError> {
        let req = ModelRequest {
            messages: self.transcript.messages().to_vec(),
            tools,
        };
        self.stats.completion_calls += 1;

        let owner = self.owner;
        let on_event = owner.on_event.clone();
        let fut = owner.model_client.send_request(req, move |delta| {
            emit(&on_event, LoopEvent::MessageDelta(delta.to_owned()));
        });
        let resp = self.interruptible(fut).await?.map_err(|err| {
            error!("chat completion failed: {err}");
            LoopError::Completion(err)
        })?;
        Ok(resp.into_message())
    }

    async fn dispatch(&mut self, calls: &[ToolCallRequest]) -> Vec<String> {
        self.stats.tool_calls += calls.len();
        let owner = self.owner;
        if owner.config.parallel_tool_calls {
            // `join_all` keeps the output in input order.
            return join_all(calls.iter().map(|call| owner.invoke_tool(call)))
                .await;
        }

        let mut observations = Vec::with_capacity(calls.len());
        for call in calls {
            observations.push(owner.invoke_tool(call).await);
        }
        observations
    }

    async fn interruptible<F: Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, LoopError> {
        let bounded = async {
            match self.deadline {
                Some(deadline) => timeout_at(deadline, fut)
                    .await
                    .map_err(|_| LoopError::DeadlineExceeded),
                None => Ok(fut.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("run cancelled while waiting for the model");
                Err(LoopError::Cancelled)
            }
            output = bounded => output,
        }
    }

    fn check_interrupted(&self) -> Result<(), LoopError> {
        if self.cancel.is_cancelled() {
            info!("run cancelled");
            return Err(LoopError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("run deadline exceeded");
            return Err(LoopError::DeadlineExceeded);
        }
        Ok(())
    }

    fn emit_state(&self, state: LoopState) {
        trace!("entering {state:?}");
        emit(&self.owner.on_event, LoopEvent::StateChanged {
            iteration: self.stats.iterations,
            state,
        });
    }

    #[inline]
    fn report(&self, result: LoopResult) -> RunReport {
        RunReport {
            result,
            stats: self.stats,
        }
    }
}

#[inline]
fn emit(on_event: &Option<EventCallback>, event: LoopEvent) {
    if let Some(on_event) = on_event {
        on_event(event);
    }
}
