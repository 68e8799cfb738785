//! Core engine for flux-dispatch
//!
//! This crate provides the action dispatch and dependency-resolution runtime
//! behind flux-dispatch: reactive state containers whose state only changes
//! through discrete, cancellable units of work.
//!
//! # Core Concepts
//!
//! - **Holder**: owns one piece of state plus its in-flight dispatch
//!   bookkeeping; state changes go out through a pluggable publisher
//! - **Action**: a unit of work (synchronous or asynchronous) against one
//!   holder's state, with its own result type
//! - **Dispatcher**: the runtime record of one action's execution: token,
//!   completion state, lifecycle events
//! - **Rule**: a middleware step deciding whether/when an action body runs
//!   relative to concurrent same-type dispatches (debounce, throttle,
//!   sequential, droppable, cancel-all, sequence gate)
//! - **Resolver**: registry of singleton holders keyed by model type and an
//!   optional family key, with cross-holder broadcast
//!
//! # Basic Example
//!
//! ```ignore
//! use flux_dispatch_core::prelude::*;
//!
//! #[derive(Clone, PartialEq, Debug, Default)]
//! struct CounterState { count: i32 }
//!
//! #[derive(Default)]
//! struct Counter;
//!
//! impl Model for Counter {
//!     type State = CounterState;
//!     fn initial(&self) -> CounterState { CounterState::default() }
//! }
//!
//! struct Increment;
//!
//! impl Action for Increment {
//!     type State = CounterState;
//!     type Output = i32;
//!
//!     fn rules(&self) -> Vec<Box<dyn Rule>> {
//!         vec![rules::debounce(std::time::Duration::from_millis(200))]
//!     }
//!
//!     fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
//!         Flow::defer(async move {
//!             let next = ctx.state().count + 1;
//!             ctx.mutate(|state| state.count = next);
//!             Ok(next)
//!         })
//!     }
//! }
//!
//! let holder = Holder::new(Counter);
//! let handle = holder.dispatch(Increment);
//! // handle.await resolves with 1 once the debounce window elapses;
//! // dispatching again within the window cancels this one instead, and
//! // then `handle` never settles.
//! ```
//!
//! # Dependency graphs
//!
//! Holders participate in a graph through a [`Resolver`]: resolving a model
//! type yields its singleton holder, creating it on first use. A model's
//! `on_resolve` hook can resolve other holders as dependencies and enable
//! auto-sync, re-running its initialization whenever a dependency's state
//! changes:
//!
//! ```ignore
//! impl Model for Sum {
//!     type State = SumState;
//!     fn initial(&self) -> SumState { SumState::default() }
//!
//!     fn on_resolve(&self, ctx: &mut ResolveContext<'_, SumState>) {
//!         let a = ctx.resolve(A::default);
//!         let b = ctx.resolve(B::default);
//!         *self.deps.lock().unwrap() = Some((a, b));
//!         ctx.enable_sync(SyncOptions::new());
//!     }
//!
//!     fn on_init(&self, holder: &Holder<SumState>, _token: &CancelToken) {
//!         if let Some((a, b)) = self.deps.lock().unwrap().clone() {
//!             holder.set_state(SumState { total: a.state().0 + b.state().0 });
//!         }
//!     }
//! }
//! ```

pub mod action;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod holder;
pub mod publisher;
pub mod resolver;
pub mod rule;
pub mod testing;
pub mod token;
mod util;

// Action exports
pub use action::{Action, ActionContext, ActionTag, DispatchInto, Flow, Operand, RaceOutput};

// Dispatcher exports
pub use dispatcher::{ActionData, ActionHandle, Dispatcher, ErasedValue, Outcome};

// Event primitive exports
pub use emitter::{Emitter, Subscription};

// Error exports
pub use error::{ActionError, DispatchError};

// Holder exports
pub use holder::{
    DispatchEvent, Holder, HolderState, Model, ResolveContext, SyncOptions, WeakHolder,
};

// Publisher exports
pub use publisher::{CallbackPublisher, Publisher, StateHandler, TracingPublisher, WatchPublisher};

// Resolver exports
pub use resolver::{AnyAction, AnyHolder, FamilyKey, Resolver};

// Rule exports
pub use rule::{Next, Rule, SequenceGate};

/// The built-in interceptor rules, re-exported as a namespace so call sites
/// read `rules::debounce(..)`.
pub mod rules {
    pub use crate::rule::{
        cancel_all, cancel_all_of, cancel_all_where, debounce, droppable, sequential, throttle,
    };
}

// Token exports
pub use token::CancelToken;

// Testing exports
pub use testing::{outcome_within, RecordingPublisher};

#[cfg(feature = "testing-time")]
pub use testing::{advance_time, pause_time, resume_time};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{
        Action, ActionContext, ActionTag, Flow, Operand, RaceOutput,
    };
    pub use crate::dispatcher::{ActionData, ActionHandle, Dispatcher, Outcome};
    pub use crate::emitter::{Emitter, Subscription};
    pub use crate::error::{ActionError, DispatchError};
    pub use crate::holder::{
        DispatchEvent, Holder, HolderState, Model, ResolveContext, SyncOptions, WeakHolder,
    };
    pub use crate::publisher::{CallbackPublisher, Publisher, TracingPublisher, WatchPublisher};
    pub use crate::resolver::{AnyAction, FamilyKey, Resolver};
    pub use crate::rule::{Next, Rule, SequenceGate};
    pub use crate::rules;
    pub use crate::testing::{outcome_within, RecordingPublisher};
    pub use crate::token::CancelToken;
}
