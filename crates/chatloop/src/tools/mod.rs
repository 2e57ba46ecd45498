//! A set of built-in tools that models can use.

mod calculator;
mod clock;

pub use calculator::CalculatorTool;
pub use clock::ClockTool;
