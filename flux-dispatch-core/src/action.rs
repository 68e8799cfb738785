//! Action trait, body kinds, and nested-work combinators
//!
//! An action is a user-defined unit of work against one holder's state. Its
//! body is a tagged variant: [`Flow::Done`] for synchronous work (no rule
//! chain, completed inline before `dispatch` returns) or [`Flow::Defer`] for
//! asynchronous work (the interceptor chain applies, and the lazy body future
//! only runs once the chain lets it through).
//!
//! `dispatch` consumes the action, so one instance can never be dispatched
//! twice; the engine keeps it behind an `Arc` afterwards for `when`
//! predicates to inspect.
//!
//! The [`ActionContext`] handed to a body proxies state access (writes are
//! silently dropped once the dispatch is cancelled), allows nested
//! dispatches, and carries the combinators `all` / `all_settled` / `race` /
//! `when` for awaiting and racing nested work.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dispatcher::{ActionHandle, Dispatcher};
use crate::error::ActionError;
use crate::holder::{DispatchEvent, Holder, HolderState};
use crate::resolver::Resolver;
use crate::rule::Rule;
use crate::token::CancelToken;
use crate::util::short_type_name;

/// Stable discriminant of a concrete action type.
///
/// Rules compare tags to find "other dispatches of the same kind", and the
/// erased dispatch path compares declared state types; neither relies on
/// reflection beyond this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ActionTag(TypeId);

impl ActionTag {
    /// The tag of action type `A`.
    pub fn of<A: Action>() -> Self {
        Self(TypeId::of::<A>())
    }
}

/// The body of an action: resolved synchronously or deferred to a future.
pub enum Flow<T> {
    /// Synchronous result; completed inline, no interceptor chain.
    Done(Result<T, ActionError>),
    /// Asynchronous body; runs under the interceptor chain. The future is
    /// lazy, so rules always execute before any body side effect.
    Defer(Pin<Box<dyn Future<Output = Result<T, ActionError>> + Send>>),
}

impl<T> Flow<T> {
    /// A synchronous success.
    pub fn now(value: T) -> Self {
        Flow::Done(Ok(value))
    }

    /// A synchronous failure.
    pub fn fail(error: impl Into<ActionError>) -> Self {
        Flow::Done(Err(error.into()))
    }

    /// An asynchronous body.
    pub fn defer<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, ActionError>> + Send + 'static,
    {
        Flow::Defer(Box::pin(future))
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Done(Ok(_)) => f.write_str("Flow::Done(Ok)"),
            Flow::Done(Err(error)) => write!(f, "Flow::Done(Err({error}))"),
            Flow::Defer(_) => f.write_str("Flow::Defer"),
        }
    }
}

/// A unit of work dispatched against a holder of `Self::State`.
pub trait Action: Send + Sync + 'static {
    /// State type this action is written against. Typed dispatch makes
    /// compatibility a compile-time fact; the erased path checks it at
    /// runtime.
    type State: HolderState;
    /// Result type delivered through the [`ActionHandle`].
    type Output: Clone + Send + Sync + 'static;

    /// Name for logging and predicates. Defaults to the type name.
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    /// Interceptor rules applied to the asynchronous kind, outermost first.
    fn rules(&self) -> Vec<Box<dyn Rule>> {
        Vec::new()
    }

    /// The body.
    fn run(&self, ctx: ActionContext<Self::State>) -> Flow<Self::Output>;
}

/// One entry of a combinator map: an immediate value, an in-flight future,
/// or a nested undispatched action (auto-dispatched on the same holder).
pub enum Operand<S: HolderState, T> {
    /// Already resolved.
    Value(T),
    /// A pending asynchronous operation.
    Future(Pin<Box<dyn Future<Output = Result<T, ActionError>> + Send>>),
    /// A nested action, dispatched when the combinator starts and cancelled
    /// when the combinator short-circuits.
    Action(Box<dyn DispatchInto<S, T>>),
}

impl<S: HolderState, T: Clone + Send + Sync + 'static> Operand<S, T> {
    /// An immediate value.
    pub fn value(value: T) -> Self {
        Operand::Value(value)
    }

    /// A pending future.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, ActionError>> + Send + 'static,
    {
        Operand::Future(Box::pin(future))
    }

    /// A nested undispatched action.
    pub fn action<A>(action: A) -> Self
    where
        A: Action<State = S, Output = T>,
    {
        Operand::Action(Box::new(action))
    }
}

impl<S: HolderState, T> std::fmt::Debug for Operand<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Value(_) => f.write_str("Operand::Value"),
            Operand::Future(_) => f.write_str("Operand::Future"),
            Operand::Action(_) => f.write_str("Operand::Action"),
        }
    }
}

/// Object-safe bridge that lets a boxed action dispatch itself on a holder
/// with the matching state type.
pub trait DispatchInto<S: HolderState, T>: Send {
    /// Dispatch the boxed action on `holder`.
    fn dispatch_into(self: Box<Self>, holder: &Holder<S>) -> ActionHandle<T>;
}

impl<A: Action> DispatchInto<A::State, A::Output> for A {
    fn dispatch_into(self: Box<Self>, holder: &Holder<A::State>) -> ActionHandle<A::Output> {
        holder.dispatch(*self)
    }
}

/// Result of a won [`ActionContext::race`].
#[derive(Debug)]
pub struct RaceOutput<K, T> {
    /// Key of the first entry to succeed.
    pub winner: K,
    /// Every entry that had settled successfully by resolution time: the
    /// winner, plus any entry that landed in the same scheduling tick.
    pub settled: HashMap<K, T>,
}

/// Execution context handed to an action body (and available to nested
/// combinator work). Cheap to clone.
pub struct ActionContext<S: HolderState> {
    holder: Holder<S>,
    dispatcher: Arc<Dispatcher>,
}

impl<S: HolderState> Clone for ActionContext<S> {
    fn clone(&self) -> Self {
        Self {
            holder: self.holder.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<S: HolderState> ActionContext<S> {
    pub(crate) fn new(holder: Holder<S>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { holder, dispatcher }
    }

    /// The holder this action runs against.
    pub fn holder(&self) -> &Holder<S> {
        &self.holder
    }

    /// The dispatcher recording this execution.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The cancellation token of this dispatch.
    pub fn token(&self) -> CancelToken {
        self.dispatcher.token().clone()
    }

    /// Whether this dispatch was cancelled. Bodies must check this before
    /// committing results at every continuation point.
    pub fn cancelled(&self) -> bool {
        self.dispatcher.token().cancelled()
    }

    /// Snapshot of the holder's current state.
    pub fn state(&self) -> S {
        self.holder.state()
    }

    /// Replace the holder's state. Silent no-op once the dispatch is
    /// cancelled. Returns whether the state actually changed.
    pub fn set_state(&self, next: S) -> bool {
        if self.cancelled() {
            return false;
        }
        self.holder.set_state(next)
    }

    /// Mutate the holder's state in place (copy-compare-swap). Silent no-op
    /// once the dispatch is cancelled.
    pub fn mutate(&self, f: impl FnOnce(&mut S)) -> bool {
        if self.cancelled() {
            return false;
        }
        self.holder.mutate(f)
    }

    /// Dispatch a nested action on the same holder.
    pub fn dispatch<A>(&self, action: A) -> ActionHandle<A::Output>
    where
        A: Action<State = S>,
    {
        self.holder.dispatch(action)
    }

    /// The resolver this holder was resolved through, if any. Lets an action
    /// resolve further dependencies when its holder participates in a
    /// dependency graph.
    pub fn resolver(&self) -> Option<Resolver> {
        self.holder.resolver()
    }

    /// Resolve with the next dispatch on this holder matching `predicate`.
    /// The listener is removed on the first match.
    pub async fn when(
        &self,
        predicate: impl Fn(&DispatchEvent) -> bool + Send + 'static,
    ) -> DispatchEvent {
        self.holder.when(predicate).await
    }

    /// Like [`ActionContext::when`], but listening on another holder.
    pub async fn when_on<S2: HolderState>(
        &self,
        other: &Holder<S2>,
        predicate: impl Fn(&DispatchEvent) -> bool + Send + 'static,
    ) -> DispatchEvent {
        other.when(predicate).await
    }

    /// Await every entry. Fails fast: the first failing entry cancels all
    /// tracked nested actions and becomes the combinator's error. Resolves
    /// to a key→value map only when every entry succeeds.
    pub async fn all<K, T>(
        &self,
        entries: impl IntoIterator<Item = (K, Operand<S, T>)>,
    ) -> Result<HashMap<K, T>, ActionError>
    where
        K: Eq + Hash + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let (mut keys, tracked, mut rx, total) = self.launch(entries);
        let mut out = HashMap::with_capacity(total);
        let mut received = 0;
        while received < total {
            let Some((index, result)) = rx.recv().await else {
                break;
            };
            received += 1;
            match result {
                Ok(value) => {
                    if let Some(key) = keys[index].take() {
                        out.insert(key, value);
                    }
                }
                Err(error) => {
                    for dispatcher in &tracked {
                        dispatcher.cancel();
                    }
                    if self.cancelled() {
                        return suppressed().await;
                    }
                    return Err(error);
                }
            }
        }
        if self.cancelled() {
            return suppressed().await;
        }
        Ok(out)
    }

    /// Await every entry, capturing failures as values. Never short-circuits.
    pub async fn all_settled<K, T>(
        &self,
        entries: impl IntoIterator<Item = (K, Operand<S, T>)>,
    ) -> HashMap<K, Result<T, ActionError>>
    where
        K: Eq + Hash + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let (mut keys, _tracked, mut rx, total) = self.launch(entries);
        let mut out = HashMap::with_capacity(total);
        let mut received = 0;
        while received < total {
            let Some((index, result)) = rx.recv().await else {
                break;
            };
            received += 1;
            if let Some(key) = keys[index].take() {
                out.insert(key, result);
            }
        }
        if self.cancelled() {
            return suppressed().await;
        }
        out
    }

    /// Resolve as soon as any entry settles. The first success cancels all
    /// other tracked nested actions; the first failure (before any success)
    /// cancels them and propagates. The settled map carries the winner plus
    /// anything else that succeeded in the same tick. A race over an empty
    /// map never resolves.
    pub async fn race<K, T>(
        &self,
        entries: impl IntoIterator<Item = (K, Operand<S, T>)>,
    ) -> Result<RaceOutput<K, T>, ActionError>
    where
        K: Eq + Hash + Clone + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let (mut keys, tracked, mut rx, _total) = self.launch(entries);
        let Some((index, first)) = rx.recv().await else {
            return suppressed().await;
        };
        match first {
            Err(error) => {
                for dispatcher in &tracked {
                    dispatcher.cancel();
                }
                if self.cancelled() {
                    return suppressed().await;
                }
                Err(error)
            }
            Ok(value) => {
                let mut settled = HashMap::new();
                let winner = match keys[index].take() {
                    Some(key) => key,
                    None => return suppressed().await,
                };
                settled.insert(winner.clone(), value);
                // Entries that settled in the same tick still count.
                while let Ok((other, result)) = rx.try_recv() {
                    if let (Ok(value), Some(key)) = (result, keys[other].take()) {
                        settled.insert(key, value);
                    }
                }
                for dispatcher in &tracked {
                    dispatcher.cancel();
                }
                if self.cancelled() {
                    return suppressed().await;
                }
                Ok(RaceOutput { winner, settled })
            }
        }
    }

    /// Start every operand and fan results into one channel, keyed by index.
    #[allow(clippy::type_complexity)]
    fn launch<K, T>(
        &self,
        entries: impl IntoIterator<Item = (K, Operand<S, T>)>,
    ) -> (
        Vec<Option<K>>,
        Vec<Arc<Dispatcher>>,
        mpsc::UnboundedReceiver<(usize, Result<T, ActionError>)>,
        usize,
    )
    where
        T: Clone + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut keys = Vec::new();
        let mut tracked = Vec::new();
        for (index, (key, operand)) in entries.into_iter().enumerate() {
            keys.push(Some(key));
            match operand {
                Operand::Value(value) => {
                    let _ = tx.send((index, Ok(value)));
                }
                Operand::Future(future) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = future.await;
                        let _ = tx.send((index, result));
                    });
                }
                Operand::Action(action) => {
                    let handle = action.dispatch_into(&self.holder);
                    tracked.push(Arc::clone(handle.dispatcher()));
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = handle.await;
                        let _ = tx.send((index, result));
                    });
                }
            }
        }
        let total = keys.len();
        (keys, tracked, rx, total)
    }
}

impl<S: HolderState> std::fmt::Debug for ActionContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("action", &self.dispatcher.name())
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

/// Once the owning dispatch is cancelled, combinator resolution is
/// suppressed: the future parks forever instead of delivering a result.
async fn suppressed<T>() -> T {
    std::future::pending::<()>().await;
    unreachable!("pending future resolved")
}
