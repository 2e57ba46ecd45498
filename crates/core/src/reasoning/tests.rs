use std::future::ready;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatloop_model::{ErrorKind, ModelMessage};
use chatloop_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::LoopConfigBuilder;
use crate::tool::{Error as ToolError, Tool, ToolResult};

static EMPTY_SCHEMA: &Value = &Value::Null;

struct SearchTool;

#[derive(Deserialize)]
struct SearchInput {
    query: String,
}

impl Tool for SearchTool {
    type Input = SearchInput;

    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Searches the web"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        ready(Ok(format!("Top result for `{}`: Team X won", input.query)))
    }
}

struct AddTool;

#[derive(Deserialize)]
struct AddInput {
    a: i64,
    b: i64,
}

impl Tool for AddTool {
    type Input = AddInput;

    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Adds two integers"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        ready(Ok((input.a + input.b).to_string()))
    }
}

struct BrokenTool;

impl Tool for BrokenTool {
    type Input = Value;

    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        _input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        ready(Err(ToolError::execution_error().with_reason("disk on fire")))
    }
}

struct PanickingTool;

#[derive(Deserialize)]
struct PanicInput {
    message: String,
}

impl Tool for PanickingTool {
    type Input = PanicInput;

    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Panics with the given message"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        async move {
            if !input.message.is_empty() {
                panic!("{}", input.message);
            }
            Ok(String::new())
        }
    }
}

/// Panics while building its future, before anything is polled.
struct LookupTool;

#[derive(Deserialize)]
struct LookupInput {
    index: usize,
}

impl Tool for LookupTool {
    type Input = LookupInput;

    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Looks up an entry of an empty table"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let table: Vec<&str> = Vec::new();
        ready(Ok(table[input.index].to_owned()))
    }
}

/// Fires a cancellation token when run.
struct CancelTool(CancellationToken);

impl Tool for CancelTool {
    type Input = Value;

    fn name(&self) -> &str {
        "cancel"
    }

    fn description(&self) -> &str {
        "Cancels the run"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        _input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        self.0.cancel();
        ready(Ok("cancelled".to_owned()))
    }
}

struct SleepTool;

#[derive(Deserialize)]
struct SleepInput {
    millis: u64,
}

impl Tool for SleepTool {
    type Input = SleepInput;

    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for a while"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        async move {
            sleep(Duration::from_millis(input.millis)).await;
            Ok(format!("slept {}ms", input.millis))
        }
    }
}

fn max_iterations(n: usize) -> LoopConfigBuilder {
    LoopConfigBuilder::new()
        .with_max_iterations(NonZeroUsize::new(n).unwrap())
}

fn tool_step(calls: &[(&str, &str, Value)]) -> PresetResponse {
    PresetResponse::with_events(
        calls
            .iter()
            .map(|(id, name, args)| {
                PresetEvent::tool_call(*id, *name, args.clone())
            })
            .collect::<Vec<_>>(),
    )
}

fn question(text: &str) -> Transcript {
    let mut transcript = Transcript::with_system_prompt("Be concise.");
    transcript.push_user(text);
    transcript
}

fn tool_results(messages: &[ModelMessage]) -> Vec<(&str, &str)> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            ModelMessage::Tool(result) => {
                Some((result.id.as_str(), result.content.as_str()))
            }
            _ => None,
        })
        .collect()
}

fn recorded_events(
    builder: ReasoningLoopBuilder,
) -> (ReasoningLoop, Arc<Mutex<Vec<LoopEvent>>>) {
    let events = Arc::new(Mutex::new(vec![]));
    let reasoning_loop = builder
        .on_event({
            let events = Arc::clone(&events);
            move |event| events.lock().unwrap().push(event)
        })
        .build();
    (reasoning_loop, events)
}

#[tokio::test]
async fn test_immediate_answer() {
    let provider = TestModelProvider::from_script([PresetResponse::text(
        "2025 champion: Team X",
    )]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(SearchTool)
            .build();

    let mut transcript = question("Who won in 2025?");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();

    assert_eq!(report.result, LoopResult::Done("2025 champion: Team X".into()));
    assert_eq!(report.stats.completion_calls, 1);
    assert_eq!(report.stats.tool_calls, 0);
    assert_eq!(provider.request_count(), 1);
    assert_eq!(provider.requests()[0].tools[0].name, "search");

    assert_eq!(transcript.len(), 3);
    assert_eq!(
        transcript.last_assistant().unwrap().content,
        "2025 champion: Team X"
    );
}

#[tokio::test]
async fn test_tool_results_in_issue_order() {
    let provider = TestModelProvider::from_script([
        tool_step(&[
            ("call_1", "search", json!({ "query": "2025 final" })),
            ("call_2", "calculator", json!({ "a": 2020, "b": 5 })),
        ]),
        PresetResponse::text("Team X won in 2025."),
    ]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(SearchTool)
            .with_tool(AddTool)
            .build();

    let mut transcript = question("Who won the 2025 final?");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();
    assert_eq!(report.result.answer(), Some("Team X won in 2025."));
    assert_eq!(report.stats.tool_calls, 2);

    // The second request already carries both observations, in order.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let messages = &requests[1].messages;
    assert_eq!(messages.len(), 5);
    assert!(matches!(
        &messages[2],
        ModelMessage::Assistant(msg) if msg.tool_calls.len() == 2
    ));
    assert_eq!(
        tool_results(messages),
        [
            ("call_1", "Top result for `2025 final`: Team X won"),
            ("call_2", "2025"),
        ]
    );

    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test]
async fn test_budget_of_one() {
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "search", json!({ "query": "champion" }))]),
        PresetResponse::text("Probably Team X."),
    ]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(SearchTool)
            .with_config(max_iterations(1).build())
            .build();

    let mut transcript = question("Who is the champion?");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();

    assert_eq!(
        report.result,
        LoopResult::BudgetExhausted(Some("Probably Team X.".into()))
    );
    assert_eq!(report.stats.completion_calls, 2);
    assert_eq!(report.stats.iterations, 1);
    assert_eq!(provider.request_count(), 2);

    // The forced call declares no tools and ends with the instruction.
    let forced = &provider.requests()[1];
    assert!(forced.tools.is_empty());
    assert_eq!(
        forced.messages.last(),
        Some(&ModelMessage::user(
            reasoning_loop.config().budget_instruction()
        ))
    );
    assert_eq!(tool_results(&forced.messages).len(), 1);
    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test]
async fn test_completion_calls_are_bounded() {
    let steps = (0..10).map(|i| {
        let id = format!("call_{i}");
        tool_step(&[(id.as_str(), "calculator", json!({ "a": i, "b": 1 }))])
    });
    let provider = TestModelProvider::from_script(steps);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(AddTool)
            .with_config(max_iterations(3).build())
            .build();

    let mut transcript = question("Count forever.");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();

    // The forced answer only requested tools, which are dropped.
    assert_eq!(report.result, LoopResult::BudgetExhausted(None));
    assert_eq!(report.stats.completion_calls, 4);
    assert_eq!(report.stats.tool_calls, 3);
    assert_eq!(provider.request_count(), 4);
    assert_eq!(provider.remaining_steps(), 6);

    assert_eq!(transcript.check_correlation(), Ok(()));
    let last = transcript.messages().last().unwrap();
    assert!(matches!(
        last,
        ModelMessage::Assistant(msg) if msg.tool_calls.is_empty()
    ));
}

#[tokio::test]
async fn test_unknown_tool_is_observed() {
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "weather", json!({ "city": "Paris" }))]),
        PresetResponse::text("I cannot check the weather."),
    ]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(SearchTool)
            .build();

    let mut transcript = question("Weather in Paris?");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();

    assert_eq!(report.result.answer(), Some("I cannot check the weather."));
    assert_eq!(
        tool_results(transcript.messages()),
        [("call_1", "Error: Unknown tool: `weather` is not registered")]
    );
    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test]
async fn test_tool_failures_are_observed() {
    let provider = TestModelProvider::from_script([
        tool_step(&[
            ("call_1", "broken", json!({})),
            ("call_2", "calculator", json!({ "a": "one" })),
            ("call_3", "explode", json!({ "message": "kaboom" })),
            ("call_4", "calculator", json!({ "a": 1, "b": 1 })),
        ]),
        PresetResponse::text("Only one tool worked."),
    ]);
    let reasoning_loop = ReasoningLoopBuilder::with_model_provider(provider)
        .with_tool(BrokenTool)
        .with_tool(AddTool)
        .with_tool(PanickingTool)
        .build();

    let mut transcript = question("Try everything.");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();
    assert_eq!(report.result.answer(), Some("Only one tool worked."));

    let results = tool_results(transcript.messages());
    assert_eq!(results[0], ("call_1", "Error: Execution error: disk on fire"));
    assert!(results[1].1.starts_with("Error: Invalid input"));
    assert_eq!(results[2], ("call_3", "Error: Execution error: `explode` panicked"));
    assert_eq!(results[3], ("call_4", "2"));
}

#[tokio::test]
async fn test_eager_tool_panic_is_observed() {
    let provider = TestModelProvider::from_script([
        tool_step(&[
            ("call_1", "lookup", json!({ "index": 3 })),
            ("call_2", "calculator", json!({ "a": 2, "b": 3 })),
        ]),
        PresetResponse::text("The table is empty."),
    ]);
    let reasoning_loop = ReasoningLoopBuilder::with_model_provider(provider)
        .with_tool(LookupTool)
        .with_tool(AddTool)
        .build();

    let mut transcript = question("What is entry 3?");
    let report = reasoning_loop.run(&mut transcript).await.unwrap();
    assert_eq!(report.result.answer(), Some("The table is empty."));

    assert_eq!(
        tool_results(transcript.messages()),
        [
            ("call_1", "Error: Execution error: `lookup` panicked"),
            ("call_2", "5"),
        ]
    );
    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test]
async fn test_eager_tool_panic_in_parallel_dispatch() {
    let provider = TestModelProvider::from_script([
        tool_step(&[
            ("call_1", "calculator", json!({ "a": 1, "b": 1 })),
            ("call_2", "lookup", json!({ "index": 0 })),
        ]),
        PresetResponse::text("Done."),
    ]);
    let config = LoopConfigBuilder::new()
        .with_parallel_tool_calls(true)
        .build();
    let reasoning_loop = ReasoningLoopBuilder::with_model_provider(provider)
        .with_tool(LookupTool)
        .with_tool(AddTool)
        .with_config(config)
        .build();

    let mut transcript = question("Add, then look up.");
    reasoning_loop.run(&mut transcript).await.unwrap();

    assert_eq!(
        tool_results(transcript.messages()),
        [
            ("call_1", "2"),
            ("call_2", "Error: Execution error: `lookup` panicked"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout() {
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "sleep", json!({ "millis": 60_000 }))]),
        PresetResponse::text("Gave up waiting."),
    ]);
    let config = LoopConfigBuilder::new()
        .with_tool_timeout(Duration::from_millis(200))
        .build();
    let reasoning_loop = ReasoningLoopBuilder::with_model_provider(provider)
        .with_tool(SleepTool)
        .with_config(config)
        .build();

    let mut transcript = question("Take a nap.");
    reasoning_loop.run(&mut transcript).await.unwrap();

    let results = tool_results(transcript.messages());
    assert!(results[0].1.starts_with("Error: Timeout: `sleep` did not finish"));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_dispatch_keeps_order() {
    let provider = TestModelProvider::from_script([
        tool_step(&[
            ("slow", "sleep", json!({ "millis": 500 })),
            ("fast", "sleep", json!({ "millis": 0 })),
        ]),
        PresetResponse::text("Both done."),
    ]);
    let config = LoopConfigBuilder::new()
        .with_parallel_tool_calls(true)
        .build();
    let (reasoning_loop, events) = recorded_events(
        ReasoningLoopBuilder::with_model_provider(provider)
            .with_tool(SleepTool)
            .with_config(config),
    );

    let mut transcript = question("Sleep twice.");
    reasoning_loop.run(&mut transcript).await.unwrap();

    assert_eq!(
        tool_results(transcript.messages()),
        [("slow", "slept 500ms"), ("fast", "slept 0ms")]
    );

    let finished: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            LoopEvent::ToolFinished { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(finished, ["fast", "slow"]);
}

#[tokio::test]
async fn test_events() {
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "broken", json!({}))]),
        PresetResponse::text("Sorry."),
    ]);
    let (reasoning_loop, events) = recorded_events(
        ReasoningLoopBuilder::with_model_provider(provider)
            .with_tool(BrokenTool),
    );

    let mut transcript = question("Break it.");
    reasoning_loop.run(&mut transcript).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(*events, [
        LoopEvent::StateChanged {
            iteration: 1,
            state: LoopState::AwaitingModel,
        },
        LoopEvent::StateChanged {
            iteration: 1,
            state: LoopState::DispatchingTools,
        },
        LoopEvent::ToolStarted {
            id: "call_1".into(),
            name: "broken".into(),
        },
        LoopEvent::ToolFinished {
            id: "call_1".into(),
            name: "broken".into(),
            is_error: true,
        },
        LoopEvent::StateChanged {
            iteration: 2,
            state: LoopState::AwaitingModel,
        },
        LoopEvent::MessageDelta("Sorry.".into()),
        LoopEvent::StateChanged {
            iteration: 2,
            state: LoopState::Done,
        },
    ]);
}

#[tokio::test]
async fn test_completion_error_is_fatal() {
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "calculator", json!({ "a": 1, "b": 2 }))]),
        PresetResponse::text("unreachable").with_failures(0),
    ]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(AddTool)
            .build();

    let mut transcript = question("1 + 2?");
    let err = reasoning_loop.run(&mut transcript).await.unwrap_err();

    let LoopError::Completion(err) = err else {
        panic!("expected a completion error, got {err:?}");
    };
    assert_eq!(err.kind(), ErrorKind::Other);
    // No retry inside the loop.
    assert_eq!(provider.request_count(), 2);
    // The observation made before the failure is kept.
    assert_eq!(tool_results(transcript.messages()), [("call_1", "3")]);
    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let provider =
        TestModelProvider::from_script([PresetResponse::text("never sent")]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone()).build();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut transcript = question("Hello?");
    let err = reasoning_loop
        .run_until_cancelled(&mut transcript, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LoopError::Cancelled));
    assert_eq!(provider.request_count(), 0);
    assert_eq!(transcript, question("Hello?"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_while_waiting_for_model() {
    let mut provider =
        TestModelProvider::from_script([PresetResponse::text("too late")]);
    provider.set_delay(Duration::from_secs(30));
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider).build();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    });

    let mut transcript = question("Hello?");
    let err = reasoning_loop
        .run_until_cancelled(&mut transcript, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LoopError::Cancelled));
    assert!(transcript.last_assistant().is_none());
}

#[tokio::test]
async fn test_cancelled_when_budget_runs_out() {
    let cancel = CancellationToken::new();
    let provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "cancel", json!({}))]),
        PresetResponse::text("Never requested."),
    ]);
    let (reasoning_loop, events) = recorded_events(
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(CancelTool(cancel.clone()))
            .with_config(max_iterations(1).build()),
    );

    let mut transcript = question("Stop.");
    let err = reasoning_loop
        .run_until_cancelled(&mut transcript, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LoopError::Cancelled));
    assert_eq!(provider.request_count(), 1);

    let exhausted = events.lock().unwrap().iter().any(|event| {
        matches!(event, LoopEvent::StateChanged {
            state: LoopState::BudgetExhausted,
            ..
        })
    });
    assert!(!exhausted);
    assert_eq!(transcript.check_correlation(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline() {
    let mut provider = TestModelProvider::from_script([
        tool_step(&[("call_1", "sleep", json!({ "millis": 2_000 }))]),
        PresetResponse::text("too late"),
    ]);
    provider.set_delay(Duration::from_millis(10));
    let config = LoopConfigBuilder::new()
        .with_run_timeout(Duration::from_secs(1))
        .build();
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone())
            .with_tool(SleepTool)
            .with_config(config)
            .build();

    let mut transcript = question("Nap, then answer.");
    let err = reasoning_loop.run(&mut transcript).await.unwrap_err();

    assert!(matches!(err, LoopError::DeadlineExceeded));
    // The tool call still got its observation.
    assert_eq!(tool_results(transcript.messages()), [("call_1", "slept 2000ms")]);
    assert_eq!(provider.request_count(), 1);
}

#[tokio::test]
async fn test_loop_is_reusable() {
    let provider = TestModelProvider::from_script([
        PresetResponse::text("first"),
        PresetResponse::text("second"),
    ]);
    let reasoning_loop =
        ReasoningLoopBuilder::with_model_provider(provider.clone()).build();

    let mut first = question("One?");
    let mut second = question("Two?");
    let first_report = reasoning_loop.run(&mut first).await.unwrap();
    let second_report = reasoning_loop.run(&mut second).await.unwrap();

    assert_eq!(first_report.result.answer(), Some("first"));
    assert_eq!(second_report.result.answer(), Some("second"));
    assert_eq!(second_report.stats.completion_calls, 1);
    // Runs share nothing but the provider.
    assert_eq!(provider.requests()[1].messages.len(), 2);
}
