//! The chat-completion capability.
//!
//! This crate establishes a unified protocol for the reasoning loop to
//! talk to a chat model: what a transcript looks like, how tools are
//! declared, and how a (possibly streaming) response reports text and
//! tool call requests.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to. Concrete network
//! clients live outside of this workspace.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
