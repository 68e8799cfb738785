//! flux-dispatch: action-dispatch runtime for reactive state containers
//!
//! State lives in holders; holders only change through dispatched actions;
//! concurrent dispatches of the same kind are governed by interceptor rules
//! (debounce, throttle, sequential, droppable); holders compose into
//! dependency graphs through a resolver and re-sync when upstream state
//! changes.
//!
//! # Example
//! ```ignore
//! use flux_dispatch::prelude::*;
//!
//! #[derive(Clone, PartialEq, Debug, Default)]
//! struct SearchState { results: Vec<String> }
//!
//! struct Search { query: String }
//!
//! impl Action for Search {
//!     type State = SearchState;
//!     type Output = usize;
//!
//!     fn rules(&self) -> Vec<Box<dyn Rule>> {
//!         vec![rules::debounce(std::time::Duration::from_millis(200))]
//!     }
//!
//!     fn run(&self, ctx: ActionContext<SearchState>) -> Flow<usize> {
//!         let query = self.query.clone();
//!         Flow::defer(async move {
//!             let results = backend_search(&query).await?;
//!             let count = results.len();
//!             ctx.mutate(|state| state.results = results);
//!             Ok(count)
//!         })
//!     }
//! }
//! ```

// Re-export everything from core
pub use flux_dispatch_core::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use flux_dispatch_core::prelude::*;
}
