//! Action combinators: all / all_settled / race / when.

use std::time::Duration;

use flux_dispatch::prelude::*;

#[derive(Clone, PartialEq, Debug, Default)]
struct CounterState {
    count: i32,
}

#[derive(Default)]
struct Counter;

impl Model for Counter {
    type State = CounterState;

    fn initial(&self) -> CounterState {
        CounterState::default()
    }
}

/// Resolves with `value` after `delay`, adding it to the counter on the way
/// out, unless cancelled first, in which case the write is suppressed.
struct NestedVal {
    value: i32,
    delay: Duration,
}

impl Action for NestedVal {
    type State = CounterState;
    type Output = i32;

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        let value = self.value;
        let delay = self.delay;
        Flow::defer(async move {
            tokio::time::sleep(delay).await;
            ctx.mutate(|state| state.count += value);
            Ok(value)
        })
    }
}

struct ComboAll;

impl Action for ComboAll {
    type State = CounterState;
    type Output = i32;

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        Flow::defer(async move {
            let resolved = ctx
                .all(vec![
                    ("plain", Operand::value(1)),
                    ("future", Operand::future(async { Ok(2) })),
                    (
                        "nested",
                        Operand::action(NestedVal {
                            value: 3,
                            delay: Duration::from_millis(5),
                        }),
                    ),
                ])
                .await?;
            assert_eq!(resolved.len(), 3);
            Ok(resolved.values().sum())
        })
    }
}

struct ComboAllFails;

impl Action for ComboAllFails {
    type State = CounterState;
    type Output = i32;

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        Flow::defer(async move {
            let resolved = ctx
                .all(vec![
                    (
                        "slow",
                        Operand::action(NestedVal {
                            value: 1,
                            delay: Duration::from_millis(10),
                        }),
                    ),
                    ("bad", Operand::future(async { Err(ActionError::msg("boom")) })),
                ])
                .await?;
            Ok(resolved.values().sum())
        })
    }
}

struct ComboSettled;

impl Action for ComboSettled {
    type State = CounterState;
    type Output = (usize, usize);

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<(usize, usize)> {
        Flow::defer(async move {
            let settled = ctx
                .all_settled(vec![
                    ("good", Operand::value(7)),
                    (
                        "bad",
                        Operand::future(async { Err(ActionError::msg("broken")) }),
                    ),
                    (
                        "nested",
                        Operand::action(NestedVal {
                            value: 2,
                            delay: Duration::from_millis(5),
                        }),
                    ),
                ])
                .await;
            let ok = settled.values().filter(|entry| entry.is_ok()).count();
            let failed = settled.values().filter(|entry| entry.is_err()).count();
            Ok((ok, failed))
        })
    }
}

struct ComboRace;

impl Action for ComboRace {
    type State = CounterState;
    type Output = (String, Option<i32>);

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<(String, Option<i32>)> {
        Flow::defer(async move {
            let outcome = ctx
                .race(vec![
                    (
                        "slow",
                        Operand::action(NestedVal {
                            value: 1,
                            delay: Duration::from_millis(10),
                        }),
                    ),
                    (
                        "fast",
                        Operand::action(NestedVal {
                            value: 2,
                            delay: Duration::from_millis(5),
                        }),
                    ),
                ])
                .await?;
            let fast = outcome.settled.get("fast").copied();
            Ok((outcome.winner.to_string(), fast))
        })
    }
}

struct Ping(i32);

impl Action for Ping {
    type State = CounterState;
    type Output = ();

    fn run(&self, _ctx: ActionContext<CounterState>) -> Flow<()> {
        Flow::now(())
    }
}

struct WaitForPing;

impl Action for WaitForPing {
    type State = CounterState;
    type Output = i32;

    fn run(&self, ctx: ActionContext<CounterState>) -> Flow<i32> {
        Flow::defer(async move {
            let event = ctx.when(|event| event.is::<Ping>()).await;
            Ok(event.action::<Ping>().map(|ping| ping.0).unwrap_or(-1))
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_round_trips_mixed_operands() {
    let holder = Holder::new(Counter);

    let result = holder.dispatch(ComboAll).await;

    assert_eq!(result.ok(), Some(6));
    // The nested action committed its own state change.
    assert_eq!(holder.state().count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_all_failure_cancels_tracked_nested_actions() {
    let holder = Holder::new(Counter);

    let result = holder.dispatch(ComboAllFails).await;

    assert_eq!(result.err().map(|error| error.to_string()), Some("boom".into()));

    // The slow nested action was cancelled before committing.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(holder.state().count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_all_settled_captures_failures_as_values() {
    let holder = Holder::new(Counter);

    let result = holder.dispatch(ComboSettled).await;

    assert_eq!(result.ok(), Some((2, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_race_resolves_with_fastest_and_cancels_the_rest() {
    let holder = Holder::new(Counter);

    let result = holder.dispatch(ComboRace).await.expect("race resolves");

    assert_eq!(result.0, "fast");
    assert_eq!(result.1, Some(2));

    // The slow entry was cancelled and never contributed.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(holder.state().count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_when_resolves_with_next_matching_dispatch() {
    let holder = Holder::new(Counter);

    let waiting = holder.dispatch(WaitForPing);
    tokio::time::sleep(Duration::from_millis(1)).await;

    holder.dispatch(Ping(7));

    assert_eq!(waiting.await.ok(), Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_when_ignores_non_matching_dispatches() {
    let holder = Holder::new(Counter);

    let waiting = holder.dispatch(WaitForPing);
    tokio::time::sleep(Duration::from_millis(1)).await;

    holder.dispatch(NestedVal {
        value: 1,
        delay: Duration::from_millis(1),
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(
        outcome_within(waiting, Duration::from_millis(5)).await.is_none(),
        "still waiting for a Ping"
    );
}
