use std::error::Error as StdError;
use std::fmt::{self, Display};

use chatloop_model::ModelProviderError;

/// A failure that ends a loop run without a result.
///
/// Tool failures never show up here, they are recorded in the transcript
/// as observations instead.
#[derive(Debug)]
pub enum LoopError {
    /// The chat-completion capability failed. The loop does not retry.
    Completion(Box<dyn ModelProviderError>),
    /// The run was cancelled by the caller.
    Cancelled,
    /// The run did not finish before its deadline.
    DeadlineExceeded,
}

impl Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Completion(err) => {
                write!(f, "chat completion failed ({}): {err}", err.kind())
            }
            LoopError::Cancelled => write!(f, "the run was cancelled"),
            LoopError::DeadlineExceeded => {
                write!(f, "the run did not finish before its deadline")
            }
        }
    }
}

impl StdError for LoopError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            LoopError::Completion(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<Box<dyn ModelProviderError>> for LoopError {
    #[inline]
    fn from(err: Box<dyn ModelProviderError>) -> Self {
        Self::Completion(err)
    }
}
