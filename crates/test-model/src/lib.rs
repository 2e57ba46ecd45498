//! A local scripted model for testing purpose.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use chatloop_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: Vec<PresetEvent>,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        // SAFETY: This type does not require to be pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(sleep) = &mut this.sleep {
            let sleep = sleep.as_mut();
            ready!(sleep.poll(cx));
            this.sleep = None;

            if this.event_idx < this.events.len() {
                let event = match &this.events[this.event_idx] {
                    PresetEvent::MessageDelta(msg) => {
                        ModelResponseEvent::MessageDelta(msg.clone())
                    }
                    PresetEvent::ToolCall(req) => {
                        ModelResponseEvent::ToolCall(req.clone())
                    }
                };
                this.event_idx += 1;
                return Poll::Ready(Ok(Some(event)));
            } else if this.event_idx == this.events.len() {
                this.event_idx += 1;
                let has_tool_call = this
                    .events
                    .iter()
                    .any(|event| matches!(event, PresetEvent::ToolCall(_)));
                return Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                    if has_tool_call {
                        ModelFinishReason::ToolCalls
                    } else {
                        ModelFinishReason::Stop
                    },
                ))));
            } else {
                // In case this method is called after completion.
                return Poll::Ready(Ok(None));
            }
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Default)]
struct Script {
    steps: VecDeque<PresetResponse>,
    failed_attempts: u64,
    requests: Vec<ModelRequest>,
}

/// A local scripted model for testing purpose.
///
/// Responses are served strictly in the order they were added, one step
/// per request, regardless of what the request contains. Every request is
/// recorded so tests can assert on how the model was called. If there are
/// no steps left, an error of kind [`ErrorKind::Other`] is returned.
///
/// A step with `failures: Some(n)` fails its first `n` attempts with
/// [`ErrorKind::RateLimitExceeded`] before being served. `Some(0)` fails
/// forever with [`ErrorKind::Other`], which is how transport errors are
/// simulated.
///
/// Clones share the same script.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing and replaying.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    /// Creates a provider that replays the given responses in order.
    pub fn from_script<I: IntoIterator<Item = PresetResponse>>(
        script: I,
    ) -> Self {
        let provider = Self::default();
        for step in script {
            provider.add_response_step(step);
        }
        provider
    }

    #[inline]
    pub fn add_response_step(&self, preset: PresetResponse) {
        self.script().steps.push_back(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests received so far, including failed ones.
    #[inline]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.script().requests.clone()
    }

    /// Returns the number of requests received so far.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.script().requests.len()
    }

    /// Returns the number of steps that have not been served yet.
    #[inline]
    pub fn remaining_steps(&self) -> usize {
        self.script().steps.len()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        // A panicking test may poison the lock, the script itself is still
        // consistent in that case.
        self.script.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn next_step(&self, req: &ModelRequest) -> Result<PresetResponse, Error> {
        let mut script = self.script();
        script.requests.push(req.clone());

        let Some(step) = script.steps.front() else {
            return Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Other,
            });
        };
        match step.failures {
            Some(0) => {
                return Err(Error {
                    message: "simulated transport failure",
                    kind: ErrorKind::Other,
                });
            }
            Some(failures) if script.failed_attempts < failures => {
                script.failed_attempts += 1;
                return Err(Error {
                    message: "simulated rate limiting",
                    kind: ErrorKind::RateLimitExceeded,
                });
            }
            _ => {}
        }

        script.failed_attempts = 0;
        let Some(step) = script.steps.pop_front() else {
            unreachable!("the front step was checked above");
        };
        Ok(step)
    }
}

impl Debug for TestModelProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestModelProvider")
            .field("remaining_steps", &self.remaining_steps())
            .field("delay", &self.delay)
            .finish()
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let delay = self.delay.unwrap_or(Duration::from_millis(1));
        let result = self.next_step(req).map(|step| TestModelResponse {
            events: step.events,
            event_idx: 0,
            delay,
            sleep: None,
        });
        future::ready(result)
    }
}
