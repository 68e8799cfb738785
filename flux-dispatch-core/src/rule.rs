//! Interceptor rules: the middleware chain in front of an action body
//!
//! A [`Rule`] wraps the continuation of a dispatch. Composition folds
//! right-to-left, so the first rule in [`Action::rules`](crate::Action::rules)
//! is the outermost call and the action body sits innermost. Each rule
//! decides whether, when, or never to run its continuation, and every
//! policy decision happens when the dispatch executes, not when the chain is
//! built.
//!
//! Rules only inspect the attach-time sibling snapshot
//! ([`Dispatcher::siblings`]); dispatchers created after the chain started
//! are invisible to it.
//!
//! Policy summary for the built-ins:
//!
//! | rule         | same-type sibling present        | otherwise        |
//! |--------------|----------------------------------|------------------|
//! | `cancel_all` | cancel matching siblings, run    | run              |
//! | `debounce`   | cancel them, run after the window| run after window |
//! | `droppable`  | cancel *this* dispatch           | run              |
//! | `sequential` | run after the sibling detaches   | run              |
//! | `throttle`   | n/a (time based)                 | run or drop      |
//!
//! `throttle` and the [`SequenceGate`] drop silently: the dispatch never
//! completes and its handle never settles. That contract is deliberate.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::action::{Action, ActionTag};
use crate::dispatcher::Dispatcher;
use crate::util::lock;

/// The continuation of a dispatch: the rest of the rule chain plus the body.
pub type Next = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One step of the interceptor chain.
pub trait Rule: Send + Sync + 'static {
    /// Wrap `next`. The returned future is the new continuation; call
    /// `next.await` inside it to proceed, or drop it to withhold the body.
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next;
}

/// Fold `rules` around `innermost`, rule 0 outermost.
pub(crate) fn compose(rules: &[Box<dyn Rule>], dispatcher: &Arc<Dispatcher>, innermost: Next) -> Next {
    let mut next = innermost;
    for rule in rules.iter().rev() {
        next = rule.apply(dispatcher, next);
    }
    next
}

#[derive(Clone)]
enum Filter {
    All,
    Tag(ActionTag),
    Predicate(Arc<dyn Fn(&Dispatcher) -> bool + Send + Sync>),
}

impl Filter {
    fn matches(&self, dispatcher: &Dispatcher) -> bool {
        match self {
            Filter::All => true,
            Filter::Tag(tag) => dispatcher.tag() == *tag,
            Filter::Predicate(predicate) => predicate(dispatcher),
        }
    }
}

struct CancelAllRule {
    filter: Filter,
}

impl Rule for CancelAllRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        let filter = self.filter.clone();
        Box::pin(async move {
            for sibling in dispatcher.siblings() {
                if filter.matches(sibling) {
                    sibling.cancel();
                }
            }
            next.await;
        })
    }
}

/// Cancel every sibling dispatch, then proceed.
pub fn cancel_all() -> Box<dyn Rule> {
    Box::new(CancelAllRule {
        filter: Filter::All,
    })
}

/// Cancel every sibling dispatch of action type `A`, then proceed.
pub fn cancel_all_of<A: Action>() -> Box<dyn Rule> {
    Box::new(CancelAllRule {
        filter: Filter::Tag(ActionTag::of::<A>()),
    })
}

/// Cancel every sibling dispatch matching `predicate`, then proceed.
pub fn cancel_all_where(
    predicate: impl Fn(&Dispatcher) -> bool + Send + Sync + 'static,
) -> Box<dyn Rule> {
    Box::new(CancelAllRule {
        filter: Filter::Predicate(Arc::new(predicate)),
    })
}

struct DebounceRule {
    window: Duration,
}

impl Rule for DebounceRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        let window = self.window;
        Box::pin(async move {
            for sibling in dispatcher.siblings() {
                if sibling.tag() == dispatcher.tag() {
                    sibling.cancel();
                }
            }
            let token = dispatcher.token().clone();
            tokio::select! {
                _ = token.until_cancelled() => {}
                _ = tokio::time::sleep(window) => next.await,
            }
        })
    }
}

/// Cancel pending same-type siblings and run only after `window` of quiet.
/// Cancelling this dispatch before the window elapses discards the deferred
/// continuation.
pub fn debounce(window: Duration) -> Box<dyn Rule> {
    Box::new(DebounceRule { window })
}

struct DroppableRule;

impl Rule for DroppableRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        Box::pin(async move {
            let occupied = dispatcher
                .siblings()
                .iter()
                .any(|sibling| sibling.tag() == dispatcher.tag() && !sibling.is_detached());
            if occupied {
                dispatcher.cancel();
            } else {
                next.await;
            }
        })
    }
}

/// If a same-type dispatch is already in flight, cancel *this* one
/// immediately; the earlier dispatch is unaffected.
pub fn droppable() -> Box<dyn Rule> {
    Box::new(DroppableRule)
}

struct SequentialRule;

impl Rule for SequentialRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        Box::pin(async move {
            let previous = dispatcher
                .siblings()
                .iter()
                .rev()
                .find(|sibling| sibling.tag() == dispatcher.tag());
            if let Some(previous) = previous {
                let (tx, rx) = oneshot::channel();
                let mut tx = Some(tx);
                // One-shot detach event: replays immediately if the sibling
                // already detached.
                previous.on_detach(move || {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                });
                let token = dispatcher.token().clone();
                tokio::select! {
                    _ = token.until_cancelled() => return,
                    _ = rx => {}
                }
            }
            next.await;
        })
    }
}

/// Defer until the most recently attached same-type dispatch has fully
/// detached, so same-type dispatches complete in issue order.
pub fn sequential() -> Box<dyn Rule> {
    Box::new(SequentialRule)
}

/// Last-execution stamp kept in the per-action-type data map.
#[derive(Clone, Copy)]
struct ThrottleStamp(Instant);

struct ThrottleRule {
    window: Duration,
}

impl Rule for ThrottleRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        let window = self.window;
        Box::pin(async move {
            let now = Instant::now();
            let allowed = dispatcher.data().update::<ThrottleStamp, _>(|slot| match slot {
                Some(stamp) if now.duration_since(stamp.0) < window => false,
                _ => {
                    *slot = Some(ThrottleStamp(now));
                    true
                }
            });
            if allowed {
                next.await;
            }
            // Not allowed: dropped. No queueing, no retry, no completion;
            // the dispatch's handle never settles.
        })
    }
}

/// Run at most once per `window`. A dispatch inside the window is dropped
/// silently: its body never runs and it never completes.
pub fn throttle(window: Duration) -> Box<dyn Rule> {
    Box::new(ThrottleRule { window })
}

/// Resumable gate admitting dispatches only in a fixed order of action kinds.
///
/// The gate keeps a cursor into the expected sequence. A dispatch matching
/// the expected step proceeds and advances the cursor (wrapping after the
/// last step). A mismatching dispatch invalidates the run: the cursor resets,
/// and the dispatch itself is admitted only if it matches the first step
/// (restarting the sequence); otherwise it is dropped silently.
///
/// One gate instance is shared (via `Arc`) by every action participating in
/// the sequence; each action returns [`SequenceGate::rule`] from its rules.
pub struct SequenceGate {
    steps: Vec<ActionTag>,
    cursor: Mutex<usize>,
}

impl SequenceGate {
    /// A gate over the given order of action kinds.
    ///
    /// # Panics
    ///
    /// Panics if `steps` is empty.
    pub fn new(steps: Vec<ActionTag>) -> Arc<Self> {
        assert!(!steps.is_empty(), "sequence gate needs at least one step");
        Arc::new(Self {
            steps,
            cursor: Mutex::new(0),
        })
    }

    /// The rule enforcing this gate; attach it to every participating action.
    pub fn rule(self: &Arc<Self>) -> Box<dyn Rule> {
        Box::new(SequenceRule {
            gate: Arc::clone(self),
        })
    }

    /// Index of the step expected next.
    pub fn position(&self) -> usize {
        *lock(&self.cursor)
    }

    /// Reset the cursor to the first step.
    pub fn reset(&self) {
        *lock(&self.cursor) = 0;
    }

    fn admit(&self, tag: ActionTag) -> bool {
        let mut cursor = lock(&self.cursor);
        if self.steps[*cursor] == tag {
            *cursor = (*cursor + 1) % self.steps.len();
            true
        } else if self.steps[0] == tag {
            // Out of order, but it restarts the sequence.
            *cursor = 1 % self.steps.len();
            true
        } else {
            *cursor = 0;
            false
        }
    }
}

struct SequenceRule {
    gate: Arc<SequenceGate>,
}

impl Rule for SequenceRule {
    fn apply(&self, dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
        let dispatcher = Arc::clone(dispatcher);
        let gate = Arc::clone(&self.gate);
        Box::pin(async move {
            if gate.admit(dispatcher.tag()) {
                next.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, Flow};
    use crate::dispatcher::ActionData;
    use crate::token::CancelToken;

    struct StepA;
    struct StepB;
    struct StepC;

    macro_rules! probe_action {
        ($name:ident) => {
            impl Action for $name {
                type State = u32;
                type Output = ();

                fn run(&self, _ctx: ActionContext<u32>) -> Flow<()> {
                    Flow::now(())
                }
            }
        };
    }

    probe_action!(StepA);
    probe_action!(StepB);
    probe_action!(StepC);

    fn dispatcher_for(tag: ActionTag, siblings: Vec<Arc<Dispatcher>>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            0,
            tag,
            "probe",
            CancelToken::new(),
            ActionData::new(),
            siblings,
        ))
    }

    struct TraceRule {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Rule for TraceRule {
        fn apply(&self, _dispatcher: &Arc<Dispatcher>, next: Next) -> Next {
            let label = self.label;
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log.lock().unwrap().push(label);
                next.await;
            })
        }
    }

    #[tokio::test]
    async fn test_compose_runs_rule_zero_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rules: Vec<Box<dyn Rule>> = vec![
            Box::new(TraceRule {
                label: "outer",
                log: Arc::clone(&log),
            }),
            Box::new(TraceRule {
                label: "inner",
                log: Arc::clone(&log),
            }),
        ];
        let dispatcher = dispatcher_for(ActionTag::of::<StepA>(), Vec::new());

        let body: Next = {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push("body");
            })
        };
        compose(&rules, &dispatcher, body).await;

        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "body"]);
    }

    #[tokio::test]
    async fn test_droppable_cancels_self_when_sibling_pending() {
        let sibling = dispatcher_for(ActionTag::of::<StepA>(), Vec::new());
        let dispatcher = dispatcher_for(ActionTag::of::<StepA>(), vec![Arc::clone(&sibling)]);

        let rule = droppable();
        rule.apply(&dispatcher, Box::pin(async {})).await;

        assert!(dispatcher.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[tokio::test]
    async fn test_droppable_proceeds_without_same_type_sibling() {
        let other = dispatcher_for(ActionTag::of::<StepB>(), Vec::new());
        let dispatcher = dispatcher_for(ActionTag::of::<StepA>(), vec![other]);

        let ran = Arc::new(Mutex::new(false));
        let body: Next = {
            let ran = Arc::clone(&ran);
            Box::pin(async move {
                *ran.lock().unwrap() = true;
            })
        };
        droppable().apply(&dispatcher, body).await;

        assert!(*ran.lock().unwrap());
        assert!(!dispatcher.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_all_of_filters_by_type() {
        let a = dispatcher_for(ActionTag::of::<StepA>(), Vec::new());
        let b = dispatcher_for(ActionTag::of::<StepB>(), Vec::new());
        let dispatcher = dispatcher_for(
            ActionTag::of::<StepC>(),
            vec![Arc::clone(&a), Arc::clone(&b)],
        );

        cancel_all_of::<StepA>()
            .apply(&dispatcher, Box::pin(async {}))
            .await;

        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_blocks_inside_window() {
        let data = ActionData::new();
        let tag = ActionTag::of::<StepA>();

        let run_throttled = |data: &ActionData| {
            let dispatcher = Arc::new(Dispatcher::new(
                0,
                tag,
                "probe",
                CancelToken::new(),
                data.clone(),
                Vec::new(),
            ));
            let ran = Arc::new(Mutex::new(false));
            let body: Next = {
                let ran = Arc::clone(&ran);
                Box::pin(async move {
                    *ran.lock().unwrap() = true;
                })
            };
            let chain = throttle(Duration::from_millis(100)).apply(&dispatcher, body);
            (chain, ran)
        };

        let (chain, ran) = run_throttled(&data);
        chain.await;
        assert!(*ran.lock().unwrap());

        // Within the window: dropped.
        tokio::time::advance(Duration::from_millis(50)).await;
        let (chain, ran) = run_throttled(&data);
        chain.await;
        assert!(!*ran.lock().unwrap());

        // At the window boundary: allowed again.
        tokio::time::advance(Duration::from_millis(50)).await;
        let (chain, ran) = run_throttled(&data);
        chain.await;
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_sequence_gate_transitions() {
        let gate = SequenceGate::new(vec![
            ActionTag::of::<StepA>(),
            ActionTag::of::<StepB>(),
            ActionTag::of::<StepC>(),
        ]);

        assert!(gate.admit(ActionTag::of::<StepA>()));
        assert!(gate.admit(ActionTag::of::<StepB>()));
        assert!(gate.admit(ActionTag::of::<StepC>()));
        // Wrapped around.
        assert_eq!(gate.position(), 0);

        // Mid-sequence mismatch drops and resets.
        assert!(gate.admit(ActionTag::of::<StepA>()));
        assert!(!gate.admit(ActionTag::of::<StepC>()));
        assert_eq!(gate.position(), 0);

        // A step-zero dispatch restarts the sequence.
        assert!(gate.admit(ActionTag::of::<StepA>()));
        assert_eq!(gate.position(), 1);
    }
}
