//! Dispatcher: the live record of one action's execution
//!
//! A [`Dispatcher`] is created when an action attaches to a holder and lives
//! until the dispatch reaches a terminal state. It owns the cancellation
//! token, the completion state (done flag, result or error), the attach-time
//! snapshot of sibling dispatchers, and the lifecycle emitters.
//!
//! State machine: `pending -> done(success)`, `pending -> done(failure)`,
//! `pending -> cancelled`. `done` and `cancelled` exclude each other: once
//! either is reached the other transition is rejected. Completion fires the
//! success or failure emitter first, then the done emitter, so listeners can
//! distinguish the outcome before reacting to generic completion.
//!
//! Results are type-erased here; the typed value travels to the caller's
//! [`ActionHandle`] over a oneshot channel wired up before erasure.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::action::ActionTag;
use crate::emitter::{Emitter, Subscription};
use crate::error::ActionError;
use crate::token::CancelToken;
use crate::util::lock;

/// A type-erased successful result.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Terminal outcome of a completed dispatch.
#[derive(Clone)]
pub enum Outcome {
    /// The body resolved with a value.
    Success(ErasedValue),
    /// The body failed.
    Failure(ActionError),
}

impl Outcome {
    /// Whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&ActionError> {
        match self {
            Outcome::Failure(error) => Some(error),
            Outcome::Success(_) => None,
        }
    }

    /// Downcast the success value.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => value.downcast_ref::<T>(),
            Outcome::Failure(_) => None,
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(_) => f.write_str("Outcome::Success"),
            Outcome::Failure(error) => write!(f, "Outcome::Failure({error})"),
        }
    }
}

/// Persistent per-action-type data map.
///
/// A holder keeps one `ActionData` per concrete action type; every dispatcher
/// of that type shares it, and it outlives individual dispatches. The
/// throttle rule stores its last-execution stamp here.
#[derive(Clone, Default)]
pub struct ActionData {
    inner: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>>,
}

impl ActionData {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone out the stored `T`, if present.
    pub fn get<T: Clone + Send + 'static>(&self) -> Option<T> {
        let map = lock(&self.inner);
        map.get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Store a `T`, replacing any previous value of the same type.
    pub fn insert<T: Send + 'static>(&self, value: T) {
        lock(&self.inner).insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Read-modify-write the stored `T` under the map lock.
    pub fn update<T: Send + 'static, R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        let mut map = lock(&self.inner);
        let key = TypeId::of::<T>();
        let mut slot: Option<T> = map
            .remove(&key)
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed);
        let result = f(&mut slot);
        if let Some(value) = slot {
            map.insert(key, Box::new(value));
        }
        result
    }
}

impl std::fmt::Debug for ActionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionData")
            .field("entries", &lock(&self.inner).len())
            .finish()
    }
}

#[derive(Default)]
struct Completion {
    done: bool,
    outcome: Option<Outcome>,
}

#[derive(Default)]
struct DetachState {
    detached: bool,
    hook: Option<Box<dyn FnOnce() + Send>>,
}

/// Runtime record of one action's single execution attempt.
pub struct Dispatcher {
    id: u64,
    tag: ActionTag,
    name: &'static str,
    token: CancelToken,
    data: ActionData,
    /// Dispatchers active on the holder when this one attached. Captured
    /// before this dispatcher joined the active list, so it never contains
    /// itself. Interceptor rules only ever look at this snapshot.
    siblings: Vec<Arc<Dispatcher>>,
    completion: Mutex<Completion>,
    detach: Mutex<DetachState>,
    success: Emitter<ErasedValue>,
    failure: Emitter<ActionError>,
    done: Emitter<Outcome>,
    detached: Emitter<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        id: u64,
        tag: ActionTag,
        name: &'static str,
        token: CancelToken,
        data: ActionData,
        siblings: Vec<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            id,
            tag,
            name,
            token,
            data,
            siblings,
            completion: Mutex::new(Completion::default()),
            detach: Mutex::new(DetachState::default()),
            success: Emitter::once(),
            failure: Emitter::once(),
            done: Emitter::once(),
            detached: Emitter::once(),
        }
    }

    /// Holder-unique id of this dispatch.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Discriminant of the concrete action type being dispatched.
    pub fn tag(&self) -> ActionTag {
        self.tag
    }

    /// Action name, for logging and predicates.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The cancellation token of this dispatch.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Persistent data shared by every dispatch of this action type.
    pub fn data(&self) -> &ActionData {
        &self.data
    }

    /// Attach-time snapshot of the holder's other active dispatchers.
    pub fn siblings(&self) -> &[Arc<Dispatcher>] {
        &self.siblings
    }

    /// Whether the dispatch completed (with or without error).
    pub fn is_done(&self) -> bool {
        lock(&self.completion).done
    }

    /// Whether the dispatch was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.cancelled()
    }

    /// Whether the dispatch was detached from its holder.
    pub fn is_detached(&self) -> bool {
        lock(&self.detach).detached
    }

    /// The stored outcome; only present once done.
    pub fn outcome(&self) -> Option<Outcome> {
        lock(&self.completion).outcome.clone()
    }

    /// The stored failure; only present once done with an error.
    pub fn error(&self) -> Option<ActionError> {
        lock(&self.completion)
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.error().cloned())
    }

    /// Record completion. Rejected (returns `false`) when already done or
    /// cancelled; otherwise stores the outcome, fires the success or failure
    /// emitter, then the done emitter.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        {
            let mut completion = lock(&self.completion);
            if completion.done || self.token.cancelled() {
                return false;
            }
            completion.done = true;
            completion.outcome = Some(outcome.clone());
        }
        tracing::debug!(action = self.name, ok = outcome.is_success(), "dispatch done");
        match &outcome {
            Outcome::Success(value) => self.success.emit(value.clone()),
            Outcome::Failure(error) => self.failure.emit(error.clone()),
        }
        self.done.emit(outcome);
        true
    }

    /// Cancel the dispatch. No-op when already done; otherwise cancels the
    /// token, which synchronously runs cancel callbacks (including the
    /// holder's detach wiring).
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        tracing::debug!(action = self.name, "dispatch cancelled");
        self.token.cancel();
    }

    /// Install the holder-removal hook run exactly once at detach.
    pub(crate) fn set_detach_hook(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.detach).hook = Some(Box::new(hook));
    }

    /// Remove the dispatcher from its holder and release handler lists.
    /// Idempotent. Fires the one-shot detached event (late subscribers get a
    /// replay) after the removal hook runs.
    pub(crate) fn detach(&self) {
        let hook = {
            let mut detach = lock(&self.detach);
            if detach.detached {
                return;
            }
            detach.detached = true;
            detach.hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        self.detached.emit(());
        self.success.clear();
        self.failure.clear();
        self.done.clear();
        self.detached.clear();
    }

    /// Detach without completing: the terminal path of a dispatch dropped by
    /// a rule (throttle window, sequence mismatch). Fires no outcome events,
    /// so the dispatch's handle never settles.
    pub(crate) fn settle_silently(&self) {
        if !self.is_done() && !self.token.cancelled() {
            tracing::debug!(action = self.name, "dispatch dropped");
            self.detach();
        }
    }

    /// Subscribe to the success event (one-shot, replayed to late subscribers).
    pub fn on_success(&self, handler: impl FnMut(ErasedValue) + Send + 'static) -> Subscription {
        self.success.on(handler)
    }

    /// Subscribe to the failure event (one-shot, replayed to late subscribers).
    pub fn on_failure(&self, handler: impl FnMut(ActionError) + Send + 'static) -> Subscription {
        self.failure.on(handler)
    }

    /// Subscribe to the done event, fired after success/failure.
    pub fn on_done(&self, handler: impl FnMut(Outcome) + Send + 'static) -> Subscription {
        self.done.on(handler)
    }

    /// Subscribe to the detach event.
    pub fn on_detach(&self, mut handler: impl FnMut() + Send + 'static) -> Subscription {
        self.detached.on(move |()| handler())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("action", &self.name)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Typed future of one dispatch.
///
/// Resolves with the action's result or error once the dispatch completes.
/// A dispatch that never completes (cancelled, debounced away, dropped by
/// `droppable`, throttled, or gated) leaves the handle pending **forever**;
/// that is the engine's contract, not a bug. Callers needing a liveness bound
/// should wrap the handle in [`tokio::time::timeout`] or use
/// [`crate::testing::outcome_within`].
pub struct ActionHandle<T> {
    rx: Option<oneshot::Receiver<Result<T, ActionError>>>,
    dispatcher: Arc<Dispatcher>,
}

impl<T> ActionHandle<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<T, ActionError>>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            rx: Some(rx),
            dispatcher,
        }
    }

    /// The dispatcher behind this handle.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Cancel the underlying dispatch.
    pub fn cancel(&self) {
        self.dispatcher.cancel();
    }

    /// Non-blocking check for a settled outcome. A synchronous action's
    /// handle settles before `dispatch` returns, so this observes its result
    /// (or failure) immediately.
    pub fn try_outcome(&mut self) -> Option<Result<T, ActionError>> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(result) => {
                self.rx = None;
                Some(result)
            }
            Err(_) => None,
        }
    }
}

impl<T: Send + 'static> Future for ActionHandle<T> {
    type Output = Result<T, ActionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.rx = None;
                Poll::Ready(result)
            }
            // The dispatch ended without completing (cancelled or dropped):
            // stay pending forever.
            Poll::Ready(Err(_)) => {
                this.rx = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for ActionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandle")
            .field("action", &self.dispatcher.name())
            .field("pending", &self.rx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe;

    impl crate::action::Action for Probe {
        type State = u32;
        type Output = u32;

        fn run(
            &self,
            _ctx: crate::action::ActionContext<u32>,
        ) -> crate::action::Flow<u32> {
            crate::action::Flow::now(0)
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            1,
            ActionTag::of::<Probe>(),
            "Probe",
            CancelToken::new(),
            ActionData::new(),
            Vec::new(),
        ))
    }

    fn ok_outcome(value: u32) -> Outcome {
        Outcome::Success(Arc::new(value))
    }

    #[test]
    fn test_complete_stores_outcome() {
        let d = dispatcher();

        assert!(d.complete(ok_outcome(5)));
        assert!(d.is_done());
        assert_eq!(d.outcome().and_then(|o| o.value::<u32>().copied()), Some(5));
        assert!(d.error().is_none());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let d = dispatcher();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        d.on_done(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(d.complete(ok_outcome(1)));
        assert!(!d.complete(ok_outcome(2)));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(d.outcome().and_then(|o| o.value::<u32>().copied()), Some(1));
    }

    #[test]
    fn test_success_fires_before_done() {
        let d = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        d.on_success(move |_| o.lock().unwrap().push("success"));
        let o = order.clone();
        d.on_done(move |_| o.lock().unwrap().push("done"));

        d.complete(ok_outcome(1));
        assert_eq!(*order.lock().unwrap(), vec!["success", "done"]);
    }

    #[test]
    fn test_failure_fires_before_done() {
        let d = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        d.on_failure(move |_| o.lock().unwrap().push("failure"));
        let o = order.clone();
        d.on_done(move |_| o.lock().unwrap().push("done"));

        d.complete(Outcome::Failure(ActionError::msg("boom")));

        assert_eq!(*order.lock().unwrap(), vec!["failure", "done"]);
        assert_eq!(d.error().map(|e| e.to_string()), Some("boom".into()));
    }

    #[test]
    fn test_cancel_after_complete_is_noop() {
        let d = dispatcher();
        d.complete(ok_outcome(1));

        d.cancel();
        assert!(!d.is_cancelled());
        assert!(d.is_done());
    }

    #[test]
    fn test_complete_after_cancel_is_rejected() {
        let d = dispatcher();
        d.cancel();

        assert!(!d.complete(ok_outcome(1)));
        assert!(!d.is_done());
        assert!(d.is_cancelled());
    }

    #[test]
    fn test_detach_runs_hook_once_and_replays() {
        let d = dispatcher();
        let hook_runs = Arc::new(AtomicUsize::new(0));

        let h = hook_runs.clone();
        d.set_detach_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        d.detach();
        d.detach();
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);

        // Late subscriber still observes the one-shot detach event.
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        d.on_detach(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settle_silently_skips_done_and_cancelled() {
        let done = dispatcher();
        done.complete(ok_outcome(1));
        done.settle_silently();
        assert!(!done.is_detached());

        let cancelled = dispatcher();
        cancelled.cancel();
        cancelled.settle_silently();
        assert!(!cancelled.is_detached());

        let dropped = dispatcher();
        dropped.settle_silently();
        assert!(dropped.is_detached());
    }

    #[test]
    fn test_action_data_update() {
        let data = ActionData::new();

        data.update::<u64, _>(|slot| {
            assert!(slot.is_none());
            *slot = Some(41);
        });
        let bumped = data.update::<u64, _>(|slot| {
            let next = slot.unwrap_or(0) + 1;
            *slot = Some(next);
            next
        });

        assert_eq!(bumped, 42);
        assert_eq!(data.get::<u64>(), Some(42));
    }

    #[tokio::test]
    async fn test_handle_settles_with_sent_result() {
        let (tx, rx) = oneshot::channel();
        let mut handle = ActionHandle::new(rx, dispatcher());

        assert!(handle.try_outcome().is_none());
        tx.send(Ok(11)).ok();

        let result = handle.await;
        assert_eq!(result.ok(), Some(11));
    }

    #[tokio::test]
    async fn test_handle_never_settles_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<Result<u32, ActionError>>();
        let handle = ActionHandle::new(rx, dispatcher());
        drop(tx);

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), handle).await;
        assert!(waited.is_err(), "handle must stay pending forever");
    }
}
