//! Sum - Dependency resolution and auto-sync example
//!
//! Two independent "cell" holders feed a derived "sum" holder. The sum
//! resolves both cells as dependencies and enables auto-sync, so every
//! change to either cell re-runs its initialization and recomputes the
//! total.
//!
//! Run with: cargo run -p sum

use std::sync::Mutex;
use std::time::Duration;

use flux_dispatch::prelude::*;

// ============================================================================
// Upstream cells
// ============================================================================

#[derive(Clone, PartialEq, Debug, Default)]
struct CellState {
    value: i32,
}

#[derive(Default)]
struct LeftCell;

impl Model for LeftCell {
    type State = CellState;

    fn initial(&self) -> CellState {
        CellState::default()
    }
}

#[derive(Default)]
struct RightCell;

impl Model for RightCell {
    type State = CellState;

    fn initial(&self) -> CellState {
        CellState::default()
    }
}

struct AddToCell(i32);

impl Action for AddToCell {
    type State = CellState;
    type Output = i32;

    fn run(&self, ctx: ActionContext<CellState>) -> Flow<i32> {
        let next = ctx.state().value + self.0;
        ctx.mutate(|state| state.value = next);
        Flow::now(next)
    }
}

// ============================================================================
// Derived sum
// ============================================================================

#[derive(Clone, PartialEq, Debug, Default)]
struct SumState {
    total: i32,
}

#[derive(Default)]
struct SumModel {
    deps: Mutex<Option<(Holder<CellState>, Holder<CellState>)>>,
}

impl Model for SumModel {
    type State = SumState;

    fn initial(&self) -> SumState {
        SumState::default()
    }

    fn on_resolve(&self, ctx: &mut ResolveContext<'_, SumState>) {
        let left = ctx.resolve(LeftCell::default);
        let right = ctx.resolve(RightCell::default);
        *self.deps.lock().unwrap() = Some((left, right));
        // Collapse bursts of upstream changes into one recompute.
        ctx.enable_sync(SyncOptions::debounced(Duration::from_millis(20)));
    }

    fn on_init(&self, holder: &Holder<SumState>, _token: &CancelToken) {
        let deps = self.deps.lock().unwrap().clone();
        if let Some((left, right)) = deps {
            holder.set_state(SumState {
                total: left.state().value + right.state().value,
            });
        }
    }
}

// ============================================================================
// Main - Resolve the graph, poke the cells, watch the sum follow
// ============================================================================

#[tokio::main]
async fn main() {
    let resolver = Resolver::new();

    let sum = resolver.resolve(SumModel::default);
    let left = resolver.resolve(LeftCell::default);
    let right = resolver.resolve(RightCell::default);

    let _subscription = sum.on_state(|state: &SumState| {
        println!("sum -> {}", state.total);
    });

    println!("left += 2, right += 3");
    left.dispatch(AddToCell(2));
    right.dispatch(AddToCell(3));
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("broadcasting +10 to every compatible holder");
    resolver.broadcast(|| Box::new(AddToCell(10)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("final sum: {}", sum.state().total);
}
