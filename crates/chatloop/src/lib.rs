//! An out-of-the-box reasoning loop with built-in tools and multi-turn
//! sessions.
//!
//! The crate includes a CLI tool for replaying scripted conversations in the
//! terminal. And you can also use it as a library to drive your own model
//! providers and tools.

#![deny(missing_docs)]

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

mod session;
pub mod tools;

pub use session::{ChatSession, SessionBuilder, Turn};

/// Re-exports of [`chatloop_core`] crate.
pub mod core {
    pub use chatloop_core::*;
}
