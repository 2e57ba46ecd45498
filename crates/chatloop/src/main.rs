//! A terminal driver that replays scripted model responses through a
//! `chatloop` session.

#[macro_use]
extern crate tracing;

use std::env;
use std::fmt::Display;
use std::io::Write as _;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::str::FromStr;
use std::time::Duration;

use chatloop::SessionBuilder;
use chatloop::core::{
    CancellationToken, LoopConfig, LoopConfigBuilder, LoopError, LoopEvent,
    LoopResult, LoopState, RunReport,
};
use chatloop_test_model::{PresetResponse, TestModelProvider};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tokio::sync::mpsc;

const BAR_CHAR: &str = "▎";

const DEMO_SCRIPT: &str = include_str!("../fixtures/demo_script.json");

/// Settings read from `CHATLOOP_*` environment variables.
struct CliConfig {
    script: Option<String>,
    max_iterations: Option<NonZeroUsize>,
    history_window: Option<usize>,
    parallel_tools: bool,
    tool_timeout: Option<Duration>,
}

impl CliConfig {
    fn from_env() -> Result<Self, String> {
        Ok(Self {
            script: env::var("CHATLOOP_SCRIPT").ok(),
            max_iterations: parse_env("CHATLOOP_MAX_ITERATIONS")?,
            history_window: parse_env("CHATLOOP_HISTORY_WINDOW")?,
            parallel_tools: parse_env("CHATLOOP_PARALLEL_TOOLS")?
                .unwrap_or(false),
            tool_timeout: parse_env("CHATLOOP_TOOL_TIMEOUT_MS")?
                .map(Duration::from_millis),
        })
    }

    fn loop_config(&self) -> LoopConfig {
        let mut builder = LoopConfigBuilder::new()
            .with_parallel_tool_calls(self.parallel_tools);
        if let Some(max_iterations) = self.max_iterations {
            builder = builder.with_max_iterations(max_iterations);
        }
        if let Some(timeout) = self.tool_timeout {
            builder = builder.with_tool_timeout(timeout);
        }
        builder.build()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };
    let script = match load_script(config.script.as_deref()).await {
        Ok(script) => script,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };
    if config.script.is_none() {
        eprintln!(
            "{}",
            "CHATLOOP_SCRIPT is not set, replaying the built-in demo".dimmed()
        );
    }
    info!("loaded a script of {} steps", script.len());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut session_builder =
        SessionBuilder::with_model_provider(TestModelProvider::from_script(
            script,
        ))
        .with_system_prompt(include_str!("./system_prompt.md"))
        .with_config(config.loop_config())
        .on_event(move |event| {
            event_tx.send(event).ok();
        });
    if let Some(window) = config.history_window {
        session_builder = session_builder.with_history_window(window);
    }
    let mut session = session_builder.build();

    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = read_line(&mut lines).await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(progress_style.clone());
        progress_bar.set_message("🤔 Thinking...");
        progress_bar.enable_steady_tick(Duration::from_millis(100));

        // Ctrl-C cancels the current turn only.
        let cancel = CancellationToken::new();
        let result = drive_turn(
            session.send_message_until_cancelled(line, &cancel),
            &cancel,
            tokio::signal::ctrl_c(),
            &mut event_rx,
            &progress_bar,
        )
        .await;

        while let Ok(event) = event_rx.try_recv() {
            show_event(&progress_bar, event);
        }
        progress_bar.finish_and_clear();
        show_result(result);
    }
}

/// Polls `turn` to completion while rendering its events. `interrupt`
/// resolving cancels the turn once.
async fn drive_turn<T>(
    turn: impl Future<Output = T>,
    cancel: &CancellationToken,
    interrupt: impl Future<Output = io::Result<()>>,
    event_rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
    progress_bar: &ProgressBar,
) -> T {
    let mut turn = pin!(turn);
    let mut interrupt = pin!(interrupt);
    let mut listening = true;
    loop {
        select! {
            result = &mut turn => return result,
            Some(event) = event_rx.recv() => {
                show_event(progress_bar, event);
            }
            signal = &mut interrupt, if listening => {
                listening = false;
                match signal {
                    Ok(()) => {
                        progress_bar.set_message("🛑 Cancelling...");
                        cancel.cancel();
                    }
                    Err(err) => warn!("cannot listen for Ctrl-C: {err}"),
                }
            }
        }
    }
}

fn show_event(progress_bar: &ProgressBar, event: LoopEvent) {
    match event {
        LoopEvent::StateChanged {
            iteration,
            state: LoopState::AwaitingModel,
        } => {
            progress_bar.set_message(format!("🤔 Thinking... (step {iteration})"));
        }
        LoopEvent::StateChanged {
            state: LoopState::BudgetExhausted,
            ..
        } => {
            progress_bar.set_message("⌛ Out of steps, wrapping up...");
        }
        LoopEvent::ToolStarted { name, .. } => {
            progress_bar.set_message(format!("🔧 Running `{name}`..."));
        }
        LoopEvent::ToolFinished { id, name, is_error } => {
            let status = if is_error {
                "failed".bright_red().to_string()
            } else {
                "done".bright_green().to_string()
            };
            progress_bar.println(format!(
                "{}🔧 {} {} {status}",
                BAR_CHAR.bright_black(),
                name.bright_white(),
                id.dimmed(),
            ));
        }
        _ => {}
    }
}

fn show_result(result: Result<RunReport, LoopError>) {
    match result {
        Ok(RunReport {
            result: LoopResult::Done(answer),
            ..
        }) => {
            println!("{}🤖 {}", BAR_CHAR.bright_cyan(), answer.bright_white());
        }
        Ok(RunReport {
            result: LoopResult::BudgetExhausted(answer),
            stats,
        }) => {
            let answer = answer.unwrap_or_else(|| "(no answer)".to_owned());
            let bar = BAR_CHAR.bright_yellow();
            println!("{bar}⌛ {}", answer.bright_white());
            println!(
                "{bar}{}",
                format!(
                    "Ran out of steps after {} iterations, this answer may be incomplete.",
                    stats.iterations
                )
                .dimmed()
            );
        }
        Err(LoopError::Cancelled) => {
            println!("{}", "Cancelled.".bright_black());
        }
        Err(err) => {
            error!("turn failed: {err}");
            eprintln!("{}{}", BAR_CHAR.bright_red(), err.bright_red());
        }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| format!("{name} is invalid: {err}")),
        Err(_) => Ok(None),
    }
}

async fn load_script(
    path: Option<&str>,
) -> Result<Vec<PresetResponse>, String> {
    let text = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|err| format!("cannot read script {path}: {err}"))?,
        None => DEMO_SCRIPT.to_owned(),
    };
    serde_json::from_str(&text).map_err(|err| format!("invalid script: {err}"))
}

async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    match lines.next_line().await {
        Ok(line) => line,
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}
