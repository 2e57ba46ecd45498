use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chatloop_model::{
    AssistantMessage, ErrorKind, ModelFinishReason, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};
use tokio::time::sleep;
use tracing::Instrument;

/// Callback receiving text deltas while a response streams in.
pub type DeltaCallback = Arc<dyn Fn(&str) + Send + Sync>;

type SendRequestResult =
    Result<ModelClientResponse, Box<dyn ModelProviderError>>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, DeltaCallback) -> BoxedSendRequestFuture
        + Send + Sync
>;

/// A wrapper around a model provider that provides a type-erased interface
/// for the other modules.
///
/// The client may optionally retry requests that failed because of rate
/// limiting. Any other failure is returned to the caller immediately.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
    retry_policy: Option<ExponentialBackoff>,
}

impl ModelClient {
    /// Creates a client for the given provider, without retrying.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req, on_delta| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_delta).await
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self {
            handler_fn,
            retry_policy: None,
        }
    }

    /// Retries rate-limited requests following the given backoff policy.
    ///
    /// The request fails with the last error once the policy gives up.
    #[inline]
    pub fn with_retry(mut self, policy: ExponentialBackoff) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sends a request and returns the response.
    ///
    /// `on_delta` is invoked with each piece of text as it arrives.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_delta: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<ModelClientResponse, Box<dyn ModelProviderError>> {
        let on_delta: DeltaCallback = Arc::new(on_delta);
        let Some(policy) = &self.retry_policy else {
            return (self.handler_fn)(req, on_delta).await;
        };

        let mut backoff = policy.clone();
        backoff.reset();
        loop {
            let result =
                (self.handler_fn)(req.clone(), Arc::clone(&on_delta)).await;
            match result {
                Err(err) if err.kind() == ErrorKind::RateLimitExceeded => {
                    let Some(wait) = backoff.next_backoff() else {
                        error!("giving up after repeated rate limiting");
                        return Err(err);
                    };
                    warn!("model is rate limited, retrying in {wait:?}");
                    sleep(wait).await;
                }
                result => return result,
            }
        }
    }
}

/// A completely received response from the model client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelClientResponse {
    /// The full text content.
    pub content: String,
    /// Tool calls requested by the model, in the order they arrived.
    pub tool_calls: Vec<ToolCallRequest>,
    /// The reason the model finished generating.
    pub finish_reason: Option<ModelFinishReason>,
}

impl ModelClientResponse {
    /// Converts the response into an assistant message.
    #[inline]
    pub fn into_message(self) -> AssistantMessage {
        AssistantMessage {
            content: self.content,
            tool_calls: self.tool_calls,
        }
    }
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_delta: DeltaCallback,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            error!("got an error: {err:?}");
            return Err(Box::new(err));
        }
    };

    let mut response = ModelClientResponse::default();

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(event) => event,
            Err(err) => {
                error!("got an error: {err:?}");
                return Err(Box::new(err));
            }
        };

        let Some(event) = event else {
            break;
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(msg) => {
                on_delta(&msg);
                response.content.push_str(&msg);
            }
            ModelResponseEvent::ToolCall(req) => {
                response.tool_calls.push(req);
            }
            ModelResponseEvent::Completed(reason) => {
                response.finish_reason = Some(reason);
                break;
            }
        }
    }

    trace!("finished a request");

    Ok(response)
}
