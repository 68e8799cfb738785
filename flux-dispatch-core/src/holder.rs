//! State holder: owner of one piece of state and its in-flight dispatches
//!
//! A [`Holder`] owns the current state value, the arena of active
//! [`Dispatcher`]s, the per-action-type data maps, the model hooks, and the
//! publisher it emits state changes through. It is a cheap-to-clone handle;
//! clones observe and drive the same holder.
//!
//! State only changes through [`Holder::set_state`] / [`Holder::mutate`],
//! which compare against the previous value and skip the publisher entirely
//! when the reduction is a no-op.
//!
//! User behavior plugs in through the [`Model`] trait (initial state,
//! dependency resolution, re-initialization, and dispatch/error hooks),
//! composed into the holder rather than inherited from it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::action::{Action, ActionContext, ActionTag, Flow};
use crate::dispatcher::{ActionData, ActionHandle, Dispatcher, ErasedValue, Outcome};
use crate::emitter::{Emitter, Subscription};
use crate::error::{ActionError, DispatchError};
use crate::publisher::{CallbackPublisher, Publisher};
use crate::resolver::{AnyAction, FamilyKey, Resolver};
use crate::rule::{self, Next};
use crate::token::CancelToken;
use crate::util::{lock, short_type_name};

/// Bounds a holder's state type must satisfy. Blanket-implemented.
///
/// `PartialEq` powers no-op reduction detection; `Clone` powers
/// copy-compare-swap reduction and snapshot reads.
pub trait HolderState: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> HolderState for T {}

/// A dispatch observed on a holder, carried by [`Holder::when`] and the
/// model's dispatch hook. Holds the erased action instance for downcasting.
#[derive(Clone)]
pub struct DispatchEvent {
    action: Arc<dyn Any + Send + Sync>,
    tag: ActionTag,
    name: &'static str,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchEvent {
    /// Whether the dispatched action is of type `A`.
    pub fn is<A: Action>(&self) -> bool {
        self.tag == ActionTag::of::<A>()
    }

    /// Downcast to the concrete action.
    pub fn action<A: Action>(&self) -> Option<&A> {
        self.action.downcast_ref::<A>()
    }

    /// Discriminant of the dispatched action type.
    pub fn tag(&self) -> ActionTag {
        self.tag
    }

    /// Action name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The dispatcher created for this dispatch.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl std::fmt::Debug for DispatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEvent")
            .field("action", &self.name)
            .finish()
    }
}

/// Behavior composed into a holder: initial state plus lifecycle hooks.
///
/// The model's type doubles as the holder's identity in the
/// [`Resolver`] registry.
pub trait Model: Send + Sync + 'static {
    /// State type this model governs.
    type State: HolderState;

    /// The state a fresh holder starts from.
    fn initial(&self) -> Self::State;

    /// One-time hook run when the holder is resolved. Resolve dependency
    /// holders and opt into auto-sync here.
    fn on_resolve(&self, _ctx: &mut ResolveContext<'_, Self::State>) {}

    /// Initialization hook: runs once after resolution, and again on every
    /// dependency change when auto-sync is enabled. `token` is cancelled
    /// when a newer run supersedes this one; long-running work should check
    /// it before committing results.
    fn on_init(&self, _holder: &Holder<Self::State>, _token: &CancelToken) {}

    /// Observes every dispatch on the holder, before the action body runs.
    fn on_dispatch(&self, _holder: &Holder<Self::State>, _event: &DispatchEvent) {}

    /// Observes every action body failure.
    fn on_error(&self, _holder: &Holder<Self::State>, _error: &ActionError) {}
}

/// Auto-sync configuration for [`ResolveContext::enable_sync`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    /// Collapse bursts of dependency changes into one re-initialization.
    pub debounce: Option<Duration>,
}

impl SyncOptions {
    /// Re-initialize on every dependency change.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-initialize after `window` of dependency quiet.
    pub fn debounced(window: Duration) -> Self {
        Self {
            debounce: Some(window),
        }
    }
}

type DepHook<S> = Box<dyn FnOnce(&Holder<S>) -> Subscription + Send>;

/// Scope handed to [`Model::on_resolve`]: resolve dependencies and opt into
/// auto-sync.
pub struct ResolveContext<'a, S: HolderState> {
    holder: &'a Holder<S>,
    resolver: &'a Resolver,
    hooks: Vec<DepHook<S>>,
    sync: Option<SyncOptions>,
}

impl<S: HolderState> ResolveContext<'_, S> {
    /// The holder being resolved.
    pub fn holder(&self) -> &Holder<S> {
        self.holder
    }

    /// The resolver driving this resolution.
    pub fn resolver(&self) -> &Resolver {
        self.resolver
    }

    /// Resolve a dependency holder (no family key) and register it for
    /// auto-sync, should [`ResolveContext::enable_sync`] be called.
    pub fn resolve<M: Model>(&mut self, create: impl FnOnce() -> M) -> Holder<M::State> {
        self.resolve_keyed(create, FamilyKey::none())
    }

    /// Resolve a dependency holder under a family key.
    pub fn resolve_keyed<M: Model>(
        &mut self,
        create: impl FnOnce() -> M,
        family: impl Into<FamilyKey>,
    ) -> Holder<M::State> {
        let dep = self.resolver.resolve_keyed(create, family);
        let hook_dep = dep.clone();
        self.hooks.push(Box::new(move |owner: &Holder<S>| {
            let weak = owner.downgrade();
            hook_dep.on_state(move |_state| {
                if let Some(owner) = weak.upgrade() {
                    owner.resync();
                }
            })
        }));
        dep
    }

    /// Re-run [`Model::on_init`] whenever any dependency resolved through
    /// this scope changes state.
    pub fn enable_sync(&mut self, options: SyncOptions) {
        self.sync = Some(options);
    }
}

struct ResolvedInfo {
    resolver: Resolver,
    family: FamilyKey,
    model_type: TypeId,
}

struct ActiveSet<S> {
    dispatchers: Vec<Arc<Dispatcher>>,
    waiters: Vec<oneshot::Sender<S>>,
}

impl<S> Default for ActiveSet<S> {
    fn default() -> Self {
        Self {
            dispatchers: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

#[derive(Default)]
struct SyncState {
    debounce: Option<Duration>,
    init_token: Option<CancelToken>,
    subscriptions: Vec<Subscription>,
}

struct HolderInner<S: HolderState> {
    model: Arc<dyn Model<State = S>>,
    state: Mutex<S>,
    publisher: Box<dyn Publisher<S>>,
    active: Mutex<ActiveSet<S>>,
    data: Mutex<HashMap<ActionTag, ActionData>>,
    dispatches: Emitter<DispatchEvent>,
    resolved: Mutex<Option<ResolvedInfo>>,
    sync: Mutex<SyncState>,
    disposed: AtomicBool,
    next_id: AtomicU64,
}

/// Handle to one state holder. Cheap to clone.
pub struct Holder<S: HolderState> {
    inner: Arc<HolderInner<S>>,
}

impl<S: HolderState> Clone for Holder<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle used by detach hooks and dispose-guard predicates so a
/// dropped holder never lingers through its own callbacks.
pub struct WeakHolder<S: HolderState> {
    inner: Weak<HolderInner<S>>,
}

impl<S: HolderState> Clone for WeakHolder<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S: HolderState> WeakHolder<S> {
    /// Upgrade back to a strong handle, if the holder is still alive.
    pub fn upgrade(&self) -> Option<Holder<S>> {
        self.inner.upgrade().map(|inner| Holder { inner })
    }
}

impl<S: HolderState> Holder<S> {
    /// A holder over `model` with the default synchronous publisher.
    pub fn new<M: Model<State = S>>(model: M) -> Self {
        Self::with_publisher(model, CallbackPublisher::new())
    }

    /// A holder over `model` emitting through `publisher`.
    pub fn with_publisher<M: Model<State = S>>(
        model: M,
        publisher: impl Publisher<S> + 'static,
    ) -> Self {
        let state = model.initial();
        Self {
            inner: Arc::new(HolderInner {
                model: Arc::new(model),
                state: Mutex::new(state),
                publisher: Box::new(publisher),
                active: Mutex::new(ActiveSet::default()),
                data: Mutex::new(HashMap::new()),
                dispatches: Emitter::multi(),
                resolved: Mutex::new(None),
                sync: Mutex::new(SyncState::default()),
                disposed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Downgrade to a non-owning handle.
    pub fn downgrade(&self) -> WeakHolder<S> {
        WeakHolder {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Identity of this holder's allocation, for registry bookkeeping.
    pub(crate) fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> S {
        lock(&self.inner.state).clone()
    }

    /// Replace the state. Emits through the publisher only when the new
    /// value differs from the old; an identical value is a silent no-op.
    /// Returns whether the state changed.
    pub fn set_state(&self, next: S) -> bool {
        let changed = {
            let mut state = lock(&self.inner.state);
            if *state == next {
                false
            } else {
                *state = next.clone();
                true
            }
        };
        if changed {
            self.inner.publisher.emit(&next);
        }
        changed
    }

    /// Mutate the state in place, copy-compare-swap. An edit that leaves the
    /// value equal to the old one does not notify. Returns whether the state
    /// changed.
    pub fn mutate(&self, f: impl FnOnce(&mut S)) -> bool {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            let previous = state.clone();
            f(&mut state);
            if *state == previous {
                None
            } else {
                Some(state.clone())
            }
        };
        match snapshot {
            Some(next) => {
                self.inner.publisher.emit(&next);
                true
            }
            None => false,
        }
    }

    /// Subscribe to state changes through the publisher.
    pub fn on_state(&self, handler: impl FnMut(&S) + Send + 'static) -> Subscription {
        self.inner.publisher.subscribe(Box::new(handler))
    }

    /// The publisher this holder emits through.
    pub fn publisher(&self) -> &dyn Publisher<S> {
        self.inner.publisher.as_ref()
    }

    /// Subscribe to every dispatch on this holder.
    pub fn on_dispatch(&self, handler: impl FnMut(DispatchEvent) + Send + 'static) -> Subscription {
        self.inner.dispatches.on(handler)
    }

    /// Resolve with the next dispatch matching `predicate`; the listener is
    /// removed as soon as it matches, so it can never fire twice.
    pub fn when(
        &self,
        predicate: impl Fn(&DispatchEvent) -> bool + Send + 'static,
    ) -> impl std::future::Future<Output = DispatchEvent> + Send {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.inner.dispatches.on_filtered(move |event| {
            let Some(sender) = tx.take() else {
                return false;
            };
            if predicate(&event) {
                let _ = sender.send(event);
                false
            } else {
                tx = Some(sender);
                true
            }
        });
        async move {
            match rx.await {
                Ok(event) => event,
                // The holder went away: match can never happen.
                Err(_) => std::future::pending().await,
            }
        }
    }

    /// Number of in-flight dispatchers.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).dispatchers.len()
    }

    /// Whether [`Holder::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Whether [`Holder::resolve`] has run.
    pub fn is_resolved(&self) -> bool {
        lock(&self.inner.resolved).is_some()
    }

    /// The family key this holder was resolved under, if any.
    pub fn family(&self) -> Option<FamilyKey> {
        lock(&self.inner.resolved)
            .as_ref()
            .map(|info| info.family.clone())
    }

    /// The resolver this holder was resolved through, if any.
    pub fn resolver(&self) -> Option<Resolver> {
        lock(&self.inner.resolved)
            .as_ref()
            .map(|info| info.resolver.clone())
    }

    pub(crate) fn model_type(&self) -> Option<TypeId> {
        lock(&self.inner.resolved)
            .as_ref()
            .map(|info| info.model_type)
    }

    /// Dispatch an action against this holder's state.
    ///
    /// Consumes the action, so one instance can only ever dispatch once.
    /// Synchronous bodies complete before this returns; asynchronous bodies
    /// run under the action's rule chain on the runtime. The returned handle
    /// settles when the dispatch completes and **never** settles when it is
    /// cancelled or dropped by a rule.
    ///
    /// # Panics
    ///
    /// Panics when called on a disposed holder.
    pub fn dispatch<A: Action<State = S>>(&self, action: A) -> ActionHandle<A::Output> {
        assert!(
            !self.is_disposed(),
            "dispatch on a disposed holder ({})",
            short_type_name::<S>()
        );

        let action = Arc::new(action);
        let tag = ActionTag::of::<A>();
        let name = action.name();
        let data = self.action_data(tag);
        let token = {
            let weak = self.downgrade();
            CancelToken::guarded(move || {
                weak.upgrade().is_none_or(|holder| holder.is_disposed())
            })
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Sibling snapshot is captured before this dispatcher joins the
        // active list, so a rule never sees the dispatch it guards.
        let dispatcher = {
            let mut active = lock(&self.inner.active);
            let siblings = active.dispatchers.clone();
            let dispatcher = Arc::new(Dispatcher::new(id, tag, name, token, data, siblings));
            active.dispatchers.push(Arc::clone(&dispatcher));
            dispatcher
        };

        {
            let weak = self.downgrade();
            dispatcher.set_detach_hook(move || {
                if let Some(holder) = weak.upgrade() {
                    holder.remove_dispatcher(id);
                }
            });
        }
        {
            // Cancellation detaches synchronously; sequential dispatches
            // queued behind this one wake off the detach event.
            let detach_target = Arc::clone(&dispatcher);
            dispatcher.token().on_cancel(move || detach_target.detach());
        }

        tracing::debug!(action = name, id, "dispatch");
        let event = DispatchEvent {
            action: action.clone() as Arc<dyn Any + Send + Sync>,
            tag,
            name,
            dispatcher: Arc::clone(&dispatcher),
        };
        self.inner.model.on_dispatch(self, &event);
        self.inner.dispatches.emit(event);

        let (tx, rx) = oneshot::channel();
        let ctx = ActionContext::new(self.clone(), Arc::clone(&dispatcher));
        match action.run(ctx) {
            Flow::Done(result) => {
                // Synchronous kind: no rule chain, settled before return.
                self.finish_dispatch(&dispatcher, result, tx);
            }
            Flow::Defer(future) => {
                let rules = action.rules();
                let innermost: Next = {
                    let holder = self.clone();
                    let dispatcher = Arc::clone(&dispatcher);
                    Box::pin(async move {
                        if dispatcher.token().cancelled() {
                            return;
                        }
                        let result = future.await;
                        holder.finish_dispatch(&dispatcher, result, tx);
                    })
                };
                let chain = rule::compose(&rules, &dispatcher, innermost);
                let spawned = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    chain.await;
                    // A chain that ended without completing or cancelling
                    // was dropped by a rule; detach it silently.
                    spawned.settle_silently();
                });
            }
        }

        ActionHandle::new(rx, dispatcher)
    }

    /// Dispatch a type-erased action. Fails loudly, before the body could
    /// ever run, when the action's declared state type does not match.
    pub fn dispatch_any(&self, action: Box<dyn AnyAction>) -> Result<(), DispatchError> {
        if self.is_disposed() {
            return Err(DispatchError::HolderDisposed);
        }
        if action.state_type() != TypeId::of::<S>() {
            return Err(DispatchError::IncompatibleState {
                action: action.action_name(),
                expected: action.state_name(),
                actual: short_type_name::<S>(),
            });
        }
        action.dispatch_on(self as &dyn Any)
    }

    fn finish_dispatch<T: Clone + Send + Sync + 'static>(
        &self,
        dispatcher: &Arc<Dispatcher>,
        result: Result<T, ActionError>,
        tx: oneshot::Sender<Result<T, ActionError>>,
    ) {
        // Cooperative checkpoint: a cancelled dispatch commits nothing.
        if dispatcher.token().cancelled() {
            return;
        }
        let outcome = match &result {
            Ok(value) => Outcome::Success(Arc::new(value.clone()) as ErasedValue),
            Err(error) => Outcome::Failure(error.clone()),
        };
        if !dispatcher.complete(outcome) {
            return;
        }
        if let Err(error) = &result {
            self.inner.model.on_error(self, error);
            self.inner.publisher.on_error(error);
        }
        let _ = tx.send(result);
        dispatcher.detach();
    }

    fn action_data(&self, tag: ActionTag) -> ActionData {
        lock(&self.inner.data).entry(tag).or_default().clone()
    }

    fn remove_dispatcher(&self, id: u64) {
        let waiters = {
            let mut active = lock(&self.inner.active);
            active.dispatchers.retain(|dispatcher| dispatcher.id() != id);
            if active.dispatchers.is_empty() {
                std::mem::take(&mut active.waiters)
            } else {
                Vec::new()
            }
        };
        self.flush_waiters(waiters);
    }

    fn flush_waiters(&self, waiters: Vec<oneshot::Sender<S>>) {
        if waiters.is_empty() {
            return;
        }
        let state = self.state();
        for waiter in waiters {
            let _ = waiter.send(state.clone());
        }
    }

    /// Cancel every in-flight dispatch.
    ///
    /// The active list is swapped out *before* any cancellation runs, so a
    /// dispatch issued from a cancellation side effect is never caught in
    /// the same sweep.
    pub fn cancel(&self) {
        let drained = {
            let mut active = lock(&self.inner.active);
            std::mem::take(&mut active.dispatchers)
        };
        for dispatcher in &drained {
            dispatcher.cancel();
        }
        let waiters = {
            let mut active = lock(&self.inner.active);
            if active.dispatchers.is_empty() {
                std::mem::take(&mut active.waiters)
            } else {
                Vec::new()
            }
        };
        self.flush_waiters(waiters);
    }

    /// Resolve with the state once no dispatcher remains active; immediately
    /// if none are active now.
    pub async fn wait(&self) -> S {
        let rx = {
            let mut active = lock(&self.inner.active);
            if active.dispatchers.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                active.waiters.push(tx);
                Some(rx)
            }
        };
        match rx {
            None => self.state(),
            Some(rx) => match rx.await {
                Ok(state) => state,
                Err(_) => self.state(),
            },
        }
    }

    /// One-time resolution: record the registry identity, run the model's
    /// [`Model::on_resolve`], wire auto-sync subscriptions if enabled, and
    /// run the first [`Model::on_init`]. Normally invoked by the
    /// [`Resolver`]; `resolved_type` is the model type the holder is
    /// registered under.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub fn resolve(&self, resolver: &Resolver, family: FamilyKey, resolved_type: TypeId) {
        {
            let mut resolved = lock(&self.inner.resolved);
            if resolved.is_some() {
                panic!(
                    "holder for {} resolved twice",
                    short_type_name::<S>()
                );
            }
            *resolved = Some(ResolvedInfo {
                resolver: resolver.clone(),
                family,
                model_type: resolved_type,
            });
        }

        let model = Arc::clone(&self.inner.model);
        let mut ctx = ResolveContext {
            holder: self,
            resolver,
            hooks: Vec::new(),
            sync: None,
        };
        model.on_resolve(&mut ctx);
        let ResolveContext { hooks, sync, .. } = ctx;

        if let Some(options) = sync {
            let subscriptions: Vec<Subscription> =
                hooks.into_iter().map(|hook| hook(self)).collect();
            let mut state = lock(&self.inner.sync);
            state.debounce = options.debounce;
            state.subscriptions = subscriptions;
        }

        // First initialization runs immediately; only dependency-triggered
        // re-runs honor the sync debounce.
        self.run_init(None);
    }

    /// Re-run initialization after a dependency change: cancel the previous
    /// still-pending init token, mint a fresh one, and invoke
    /// [`Model::on_init`] (debounced when auto-sync was configured that way).
    pub(crate) fn resync(&self) {
        let debounce = lock(&self.inner.sync).debounce;
        self.run_init(debounce);
    }

    fn run_init(&self, debounce: Option<Duration>) {
        if self.is_disposed() {
            return;
        }
        let (previous, token) = {
            let mut sync = lock(&self.inner.sync);
            let previous = sync.init_token.take();
            let weak = self.downgrade();
            let token = CancelToken::guarded(move || {
                weak.upgrade().is_none_or(|holder| holder.is_disposed())
            });
            sync.init_token = Some(token.clone());
            (previous, token)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        match debounce {
            None => self.inner.model.on_init(self, &token),
            Some(window) => {
                let holder = self.clone();
                let run_token = token;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = run_token.until_cancelled() => {}
                        _ = tokio::time::sleep(window) => {
                            if !run_token.cancelled() {
                                holder.inner.model.on_init(&holder, &run_token);
                            }
                        }
                    }
                });
            }
        }
    }

    /// Dispose the holder: tear down auto-sync, cancel the pending init run
    /// and every in-flight dispatch. Exactly-once; repeat calls are no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(state = short_type_name::<S>(), "holder disposed");
        let (subscriptions, init_token) = {
            let mut sync = lock(&self.inner.sync);
            (
                std::mem::take(&mut sync.subscriptions),
                sync.init_token.take(),
            )
        };
        for subscription in subscriptions {
            subscription.cancel();
        }
        if let Some(token) = init_token {
            token.cancel();
        }
        self.cancel();
    }
}

impl<S: HolderState> std::fmt::Debug for Holder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Holder")
            .field("state", &short_type_name::<S>())
            .field("active", &self.active_count())
            .field("resolved", &self.is_resolved())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
