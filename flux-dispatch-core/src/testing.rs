//! Test utilities for flux-dispatch applications
//!
//! - [`RecordingPublisher`]: captures every emitted state so tests can
//!   assert on the exact notification sequence (including its absence for
//!   no-op reductions).
//! - [`outcome_within`]: bounded await of an [`ActionHandle`]. Handles of
//!   cancelled/dropped dispatches never settle by design, so tests must
//!   always bound the wait.
//! - Time control helpers (behind the `testing-time` feature) for driving
//!   debounce/throttle windows deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatcher::ActionHandle;
use crate::emitter::{Emitter, Subscription};
use crate::error::ActionError;
use crate::holder::HolderState;
use crate::publisher::{Publisher, StateHandler};

/// Publisher that records every emission (and every error) while still
/// fanning out to callback subscribers.
pub struct RecordingPublisher<S: HolderState> {
    emitted: Arc<Mutex<Vec<S>>>,
    errors: Arc<Mutex<Vec<ActionError>>>,
    changes: Emitter<S>,
}

impl<S: HolderState> RecordingPublisher<S> {
    /// An empty recorder.
    pub fn new() -> Self {
        Self {
            emitted: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            changes: Emitter::multi(),
        }
    }

    /// Shared handle to the emission log. Grab it before handing the
    /// publisher to a holder.
    pub fn emitted_handle(&self) -> Arc<Mutex<Vec<S>>> {
        Arc::clone(&self.emitted)
    }

    /// Shared handle to the error log.
    pub fn errors_handle(&self) -> Arc<Mutex<Vec<ActionError>>> {
        Arc::clone(&self.errors)
    }
}

impl<S: HolderState> Default for RecordingPublisher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: HolderState> Publisher<S> for RecordingPublisher<S> {
    fn emit(&self, state: &S) {
        self.emitted.lock().unwrap_or_else(|e| e.into_inner()).push(state.clone());
        self.changes.emit(state.clone());
    }

    fn subscribe(&self, mut handler: StateHandler<S>) -> Subscription {
        self.changes.on(move |state| handler(&state))
    }

    fn on_error(&self, error: &ActionError) {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).push(error.clone());
    }
}

/// Await `handle` for at most `within`. Returns `None` when the dispatch did
/// not settle in time, which, for cancelled/dropped dispatches, it never
/// will.
pub async fn outcome_within<T: Send + 'static>(
    handle: ActionHandle<T>,
    within: Duration,
) -> Option<Result<T, ActionError>> {
    tokio::time::timeout(within, handle).await.ok()
}

/// Pause tokio's clock. Requires a current-thread runtime.
#[cfg(feature = "testing-time")]
pub fn pause_time() {
    tokio::time::pause();
}

/// Resume tokio's clock.
#[cfg(feature = "testing-time")]
pub fn resume_time() {
    tokio::time::resume();
}

/// Advance tokio's paused clock by `duration`, firing due timers.
#[cfg(feature = "testing-time")]
pub async fn advance_time(duration: Duration) {
    tokio::time::advance(duration).await;
}
