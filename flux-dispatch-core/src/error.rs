//! Error types for the dispatch engine
//!
//! Two distinct failure families exist:
//!
//! - [`ActionError`]: a failure produced by an action body. It is stored on
//!   the dispatcher, routed through the failure and done emitters, and
//!   surfaced to the caller through the [`ActionHandle`](crate::ActionHandle).
//!   Cloneable so one failure can fan out to every observer.
//! - [`DispatchError`]: structural misuse on the type-erased dispatch path,
//!   raised synchronously and never swallowed.
//!
//! Cancellation is *not* an error: a cancelled dispatch reaches a terminal
//! non-error state and its handle never settles.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A failure raised by an action body.
///
/// Wraps any [`std::error::Error`] behind an `Arc`, so it is cheap to clone
/// into the failure emitter, the done emitter, the typed handle, and the
/// holder's error hook.
#[derive(Clone)]
pub struct ActionError {
    inner: Arc<dyn Error + Send + Sync>,
}

impl ActionError {
    /// Wrap an existing error.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// The wrapped error.
    pub fn get(&self) -> &(dyn Error + Send + Sync) {
        self.inner.as_ref()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error for ActionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

/// Message-only error payload behind [`ActionError::msg`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// Structural errors on the erased dispatch path.
///
/// These are programmer errors and are always loud: `dispatch_any` returns
/// them synchronously, before the action body could ever run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The action's declared state type does not match the holder's.
    #[error("action `{action}` targets state `{expected}`, but the holder owns `{actual}`")]
    IncompatibleState {
        /// Name of the offending action.
        action: &'static str,
        /// State type the action was written against.
        expected: &'static str,
        /// State type the holder actually owns.
        actual: &'static str,
    },
    /// The target holder has already been disposed.
    #[error("holder is disposed")]
    HolderDisposed,
}
