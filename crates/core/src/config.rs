//! Configurations of the reasoning loop.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_MAX_ITERATIONS: NonZeroUsize = NonZeroUsize::new(5).unwrap();

const DEFAULT_BUDGET_INSTRUCTION: &str = "You have run out of tool calls. \
Answer using only the information already gathered. Do not call any more \
tools.";

/// Builder for [`LoopConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LoopConfigBuilder {
    max_iterations: Option<NonZeroUsize>,
    budget_instruction: Option<String>,
    parallel_tool_calls: bool,
    tool_timeout: Option<Duration>,
    run_timeout: Option<Duration>,
}

impl LoopConfigBuilder {
    /// Creates a builder with default settings.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many model calls may request tools before the loop forces
    /// a final answer.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: NonZeroUsize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Sets the instruction appended to the transcript when the iteration
    /// budget is exhausted.
    #[inline]
    pub fn with_budget_instruction<S: Into<String>>(
        mut self,
        instruction: S,
    ) -> Self {
        self.budget_instruction = Some(instruction.into());
        self
    }

    /// Allows tool calls requested in one response to run concurrently.
    ///
    /// Results are still appended in the order the calls were issued.
    #[inline]
    pub fn with_parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    /// Bounds every single tool call. A call that runs longer is recorded
    /// as a timeout observation.
    #[inline]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    /// Bounds a whole loop run. The deadline is checked before every model
    /// call and also interrupts a pending model call.
    #[inline]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    #[inline]
    pub fn build(self) -> LoopConfig {
        LoopConfig {
            max_iterations: self
                .max_iterations
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            budget_instruction: self
                .budget_instruction
                .unwrap_or_else(|| DEFAULT_BUDGET_INSTRUCTION.to_owned()),
            parallel_tool_calls: self.parallel_tool_calls,
            tool_timeout: self.tool_timeout,
            run_timeout: self.run_timeout,
        }
    }
}

/// Configuration of a [`ReasoningLoop`](crate::ReasoningLoop).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoopConfig {
    pub(crate) max_iterations: NonZeroUsize,
    pub(crate) budget_instruction: String,
    pub(crate) parallel_tool_calls: bool,
    pub(crate) tool_timeout: Option<Duration>,
    pub(crate) run_timeout: Option<Duration>,
}

impl LoopConfig {
    /// Returns the iteration budget.
    #[inline]
    pub fn max_iterations(&self) -> NonZeroUsize {
        self.max_iterations
    }

    /// Returns the instruction used to force a final answer.
    #[inline]
    pub fn budget_instruction(&self) -> &str {
        &self.budget_instruction
    }

    /// Returns whether tool calls of one response may run concurrently.
    #[inline]
    pub fn parallel_tool_calls(&self) -> bool {
        self.parallel_tool_calls
    }

    /// Returns the per-call tool timeout.
    #[inline]
    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout
    }

    /// Returns the timeout of a whole run.
    #[inline]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }
}

impl Default for LoopConfig {
    #[inline]
    fn default() -> Self {
        LoopConfigBuilder::new().build()
    }
}
