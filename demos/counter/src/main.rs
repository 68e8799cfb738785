//! Counter - Minimal flux-dispatch example
//!
//! This example demonstrates the core pattern in ~100 lines:
//! - State: What the holder knows
//! - Model: Where state lives
//! - Actions: Units of work with interceptor rules
//! - Dispatch: Debounced and sequential execution
//!
//! Run with: cargo run -p counter

use std::time::Duration;

use flux_dispatch::prelude::*;

// ============================================================================
// State - What the holder knows
// ============================================================================

#[derive(Clone, PartialEq, Debug, Default)]
struct CounterState {
    count: i32,
}

// ============================================================================
// Model - Where state lives
// ============================================================================

#[derive(Default)]
struct Counter;

impl Model for Counter {
    type State = CounterState;

    fn initial(&self) -> CounterState {
        CounterState::default()
    }
}

// ============================================================================
// Actions - Units of work, each with its own concurrency policy
// ============================================================================

/// Debounced: a burst of dispatches collapses into a single increment.
struct DebouncedIncrement;

impl Action for DebouncedIncrement {
    type State = CounterState;
    type Output = i32;

    fn rules(&self) -> Vec<Box<dyn Rule>> {
        vec![rules::debounce(Duration::from_millis(100))]
    }

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        Flow::defer(async move {
            let next = ctx.state().count + 1;
            ctx.mutate(|state| state.count = next);
            Ok(next)
        })
    }
}

/// Sequential: slow increments complete strictly in issue order.
struct SlowIncrement;

impl Action for SlowIncrement {
    type State = CounterState;
    type Output = i32;

    fn rules(&self) -> Vec<Box<dyn Rule>> {
        vec![rules::sequential()]
    }

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        Flow::defer(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let next = ctx.state().count + 1;
            ctx.mutate(|state| state.count = next);
            Ok(next)
        })
    }
}

// ============================================================================
// Main - Dispatch, observe, wait
// ============================================================================

#[tokio::main]
async fn main() {
    let holder = Holder::new(Counter);

    let _subscription = holder.on_state(|state: &CounterState| {
        println!("counter -> {}", state.count);
    });

    // A burst of three debounced dispatches: only the last one runs.
    println!("dispatching 3 debounced increments...");
    for _ in 0..3 {
        holder.dispatch(DebouncedIncrement);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Three sequential slow increments: they queue behind each other.
    println!("dispatching 3 sequential slow increments...");
    for _ in 0..3 {
        holder.dispatch(SlowIncrement);
    }

    let final_state = holder.wait().await;
    println!("final count: {}", final_state.count);
}
