use std::fmt::{self, Display};

/// The stage a loop run is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// Waiting for the model to respond.
    #[default]
    AwaitingModel,
    /// Running the tool calls of the last response.
    DispatchingTools,
    /// The model answered without requesting tools.
    Done,
    /// The iteration budget ran out while the model still requested tools.
    BudgetExhausted,
}

impl LoopState {
    /// Returns `true` if no further transition is possible.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::BudgetExhausted)
    }
}

/// Progress notifications of a loop run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopEvent {
    /// The run moved to another state. `iteration` is 1-based.
    StateChanged {
        /// The current iteration.
        iteration: usize,
        /// The new state.
        state: LoopState,
    },
    /// A piece of assistant text streamed in.
    MessageDelta(String),
    /// A tool call is about to run.
    ToolStarted {
        /// The call identifier.
        id: String,
        /// The requested tool.
        name: String,
    },
    /// A tool call has been resolved.
    ToolFinished {
        /// The call identifier.
        id: String,
        /// The requested tool.
        name: String,
        /// Whether the observation is an error.
        is_error: bool,
    },
}

/// The terminal output of a loop run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoopResult {
    /// The model gave a final answer on its own.
    Done(String),
    /// The iteration budget ran out. Holds the forced answer, if the model
    /// produced any text for it.
    BudgetExhausted(Option<String>),
}

impl LoopResult {
    /// Returns the answer text, if any.
    #[inline]
    pub fn answer(&self) -> Option<&str> {
        match self {
            LoopResult::Done(answer) => Some(answer),
            LoopResult::BudgetExhausted(answer) => answer.as_deref(),
        }
    }

    /// Returns `true` if the iteration budget was exhausted.
    #[inline]
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, LoopResult::BudgetExhausted(_))
    }

    /// Returns the terminal state this result corresponds to.
    #[inline]
    pub fn state(&self) -> LoopState {
        match self {
            LoopResult::Done(_) => LoopState::Done,
            LoopResult::BudgetExhausted(_) => LoopState::BudgetExhausted,
        }
    }
}

impl Display for LoopResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopResult::Done(answer) => f.write_str(answer),
            LoopResult::BudgetExhausted(Some(answer)) => {
                write!(f, "{answer} (iteration budget exhausted)")
            }
            LoopResult::BudgetExhausted(None) => {
                f.write_str("(iteration budget exhausted, no answer)")
            }
        }
    }
}

/// Counters of a loop run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RunStats {
    /// Iterations started, at most the configured budget.
    pub iterations: usize,
    /// Chat-completion calls issued, including the forced final one.
    pub completion_calls: usize,
    /// Tool calls resolved, including unknown and failed ones.
    pub tool_calls: usize,
}

/// What a successful loop run returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// The terminal output.
    pub result: LoopResult,
    /// Counters of the run.
    pub stats: RunStats,
}
