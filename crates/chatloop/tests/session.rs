use std::num::NonZeroUsize;

use chatloop::SessionBuilder;
use chatloop::core::{LoopConfigBuilder, LoopError, LoopResult};
use chatloop_model::ModelMessage;
use chatloop_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use serde_json::json;

fn user_inputs(messages: &[ModelMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            ModelMessage::User { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_demo_script() {
    let script: Vec<PresetResponse> =
        serde_json::from_str(include_str!("../fixtures/demo_script.json"))
            .unwrap();
    let provider = TestModelProvider::from_script(script);
    let mut session = SessionBuilder::with_model_provider(provider.clone())
        .with_system_prompt("Be helpful.")
        .build();

    let report = session.send_message("What is 2^10 + 1?").await.unwrap();
    assert_eq!(
        report.result,
        LoopResult::Done("2 to the power of 10, plus 1, is 1025.".to_owned())
    );
    let requests = provider.requests();
    assert_eq!(requests[0].tools.len(), 2);
    assert_eq!(
        requests[1].messages.last(),
        Some(&ModelMessage::tool_result("call_1", "1025"))
    );

    let report = session.send_message("What time is it in Tokyo?").await.unwrap();
    assert_eq!(report.stats.tool_calls, 1);
    let requests = provider.requests();
    let observation = requests[3].messages.last().unwrap().content();
    assert!(observation.starts_with("Current time in Tokyo: "));
    assert!(observation.ends_with("(UTC+09:00)"));

    session.send_message("Thanks!").await.unwrap();
    assert_eq!(provider.remaining_steps(), 0);
    assert_eq!(session.history().len(), 3);
}

#[tokio::test]
async fn test_history_is_replayed() {
    let provider = TestModelProvider::from_script([
        PresetResponse::text("Nice to meet you, Ada."),
        PresetResponse::text("Your name is Ada."),
    ]);
    let mut session = SessionBuilder::with_model_provider(provider.clone())
        .with_system_prompt("Remember what the user says.")
        .build();

    session.send_message("My name is Ada.").await.unwrap();
    session.send_message("What is my name?").await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests[1].messages, [
        ModelMessage::system("Remember what the user says."),
        ModelMessage::user("My name is Ada."),
        ModelMessage::assistant("Nice to meet you, Ada."),
        ModelMessage::user("What is my name?"),
    ]);
}

#[tokio::test]
async fn test_history_window() {
    let provider = TestModelProvider::from_script(
        (1..=4).map(|i| PresetResponse::text(format!("answer {i}"))),
    );
    let mut session = SessionBuilder::with_model_provider(provider.clone())
        .with_history_window(2)
        .build();

    for i in 1..=4 {
        session.send_message(&format!("question {i}")).await.unwrap();
    }

    let requests = provider.requests();
    assert_eq!(
        user_inputs(&requests[3].messages),
        ["question 2", "question 3", "question 4"]
    );
    let remembered: Vec<_> =
        session.history().map(|turn| turn.input.as_str()).collect();
    assert_eq!(remembered, ["question 3", "question 4"]);

    session.clear_history();
    assert_eq!(session.history().len(), 0);
}

#[tokio::test]
async fn test_budget_exhausted_turn_is_remembered() {
    let provider = TestModelProvider::from_script([
        PresetResponse::with_events([PresetEvent::tool_call(
            "call_1",
            "calculator",
            json!({ "expression": "1 / 3" }),
        )]),
        PresetResponse::text("About 0.33."),
    ]);
    let config = LoopConfigBuilder::new()
        .with_max_iterations(NonZeroUsize::MIN)
        .build();
    let mut session = SessionBuilder::with_model_provider(provider.clone())
        .with_config(config)
        .build();

    let report = session.send_message("What is 1 / 3?").await.unwrap();
    assert_eq!(
        report.result,
        LoopResult::BudgetExhausted(Some("About 0.33.".to_owned()))
    );
    assert_eq!(provider.request_count(), 2);

    let turn = session.history().next().unwrap();
    assert_eq!(turn.answer.as_deref(), Some("About 0.33."));
}

#[tokio::test]
async fn test_failed_turn_is_forgotten() {
    let provider = TestModelProvider::from_script([
        PresetResponse::text("unreachable").with_failures(0),
    ]);
    let mut session = SessionBuilder::with_model_provider(provider).build();

    let err = session.send_message("Hello?").await.unwrap_err();
    assert!(matches!(err, LoopError::Completion(_)));
    assert_eq!(session.history().len(), 0);
}
