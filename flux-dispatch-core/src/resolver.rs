//! Dependency resolver: singleton holders keyed by model type and family
//!
//! A [`Resolver`] maps `(model type, family key)` pairs to live holders.
//! The first resolution of a pair constructs the holder through the supplied
//! factory, registers it, and runs its one-time resolution; later
//! resolutions return the existing instance untouched. A family key lets
//! several independent holders of one model type coexist (per-entity state).
//!
//! [`Resolver::broadcast`] walks every registered holder and dispatches a
//! fresh action instance to each holder whose state type is compatible,
//! silently skipping the rest.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::action::Action;
use crate::error::DispatchError;
use crate::holder::{Holder, HolderState, Model};
use crate::util::{lock, short_type_name};

/// Secondary key distinguishing independent holders of one model type.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct FamilyKey(Option<Arc<str>>);

impl FamilyKey {
    /// The default, key-less family.
    pub fn none() -> Self {
        Self(None)
    }

    /// The key value, if any.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<&str> for FamilyKey {
    fn from(key: &str) -> Self {
        Self(Some(Arc::from(key)))
    }
}

impl From<String> for FamilyKey {
    fn from(key: String) -> Self {
        Self(Some(Arc::from(key.as_str())))
    }
}

impl std::fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(key) => write!(f, "{key}"),
            None => f.write_str("<none>"),
        }
    }
}

/// A type-erased, undispatched action, as produced by a
/// [`Resolver::broadcast`] factory. Blanket-implemented for every
/// [`Action`].
pub trait AnyAction: Send {
    /// `TypeId` of the action's declared state type.
    fn state_type(&self) -> TypeId;
    /// Name of the action's declared state type.
    fn state_name(&self) -> &'static str;
    /// Action name.
    fn action_name(&self) -> &'static str;
    /// Dispatch on the (already compatibility-checked) holder behind `holder`.
    fn dispatch_on(self: Box<Self>, holder: &dyn Any) -> Result<(), DispatchError>;
}

impl<A: Action> AnyAction for A {
    fn state_type(&self) -> TypeId {
        TypeId::of::<A::State>()
    }

    fn state_name(&self) -> &'static str {
        short_type_name::<A::State>()
    }

    fn action_name(&self) -> &'static str {
        self.name()
    }

    fn dispatch_on(self: Box<Self>, holder: &dyn Any) -> Result<(), DispatchError> {
        let name = self.name();
        let Some(holder) = holder.downcast_ref::<Holder<A::State>>() else {
            return Err(DispatchError::IncompatibleState {
                action: name,
                expected: short_type_name::<A::State>(),
                actual: "unknown",
            });
        };
        holder.dispatch(*self);
        Ok(())
    }
}

/// A holder with its state type erased, as stored in the registry.
pub trait AnyHolder: Send + Sync {
    /// The typed holder, for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// `TypeId` of the owned state type.
    fn state_type(&self) -> TypeId;
    /// Name of the owned state type.
    fn state_name(&self) -> &'static str;
    /// Dispatch an erased action; fails on state-type mismatch.
    fn accept(&self, action: Box<dyn AnyAction>) -> Result<(), DispatchError>;
    /// Dispose the holder.
    fn dispose_erased(&self);
    /// Identity of the underlying holder allocation.
    fn instance_id(&self) -> usize;
}

impl<S: HolderState> AnyHolder for Holder<S> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn state_type(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn state_name(&self) -> &'static str {
        short_type_name::<S>()
    }

    fn accept(&self, action: Box<dyn AnyAction>) -> Result<(), DispatchError> {
        self.dispatch_any(action)
    }

    fn dispose_erased(&self) {
        self.dispose();
    }

    fn instance_id(&self) -> usize {
        self.ptr_id()
    }
}

type RegistryKey = (TypeId, FamilyKey);

/// Registry of singleton holders. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct Resolver {
    inner: Arc<Mutex<HashMap<RegistryKey, Arc<dyn AnyHolder>>>>,
}

impl Resolver {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the key-less holder for model `M`, constructing it through
    /// `create` on first resolution.
    pub fn resolve<M: Model>(&self, create: impl FnOnce() -> M) -> Holder<M::State> {
        self.resolve_keyed(create, FamilyKey::none())
    }

    /// Resolve the holder for `(M, family)`. An existing holder is returned
    /// as-is; `create` does not run and resolution is not repeated.
    pub fn resolve_keyed<M: Model>(
        &self,
        create: impl FnOnce() -> M,
        family: impl Into<FamilyKey>,
    ) -> Holder<M::State> {
        let family = family.into();
        let key = (TypeId::of::<M>(), family.clone());
        if let Some(existing) = self.lookup::<M>(&key) {
            return existing;
        }

        let holder = Holder::new(create());
        {
            let mut registry = lock(&self.inner);
            // A nested resolution may have registered the pair meanwhile.
            if let Some(entry) = registry.get(&key) {
                if let Some(existing) = entry.as_any().downcast_ref::<Holder<M::State>>() {
                    return existing.clone();
                }
            }
            registry.insert(key, Arc::new(holder.clone()));
        }

        tracing::debug!(model = short_type_name::<M>(), %family, "holder created");
        holder.resolve(self, family, TypeId::of::<M>());
        holder
    }

    fn lookup<M: Model>(&self, key: &RegistryKey) -> Option<Holder<M::State>> {
        lock(&self.inner)
            .get(key)
            .and_then(|entry| entry.as_any().downcast_ref::<Holder<M::State>>())
            .cloned()
    }

    /// Whether a holder is registered for `(M, family)`.
    pub fn contains<M: Model>(&self, family: impl Into<FamilyKey>) -> bool {
        lock(&self.inner).contains_key(&(TypeId::of::<M>(), family.into()))
    }

    /// Number of registered holders.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Whether no holders are registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Unregister and dispose a holder previously resolved through this
    /// registry. Returns whether it was registered.
    pub fn remove<S: HolderState>(&self, holder: &Holder<S>) -> bool {
        let Some(model_type) = holder.model_type() else {
            return false;
        };
        let family = holder.family().unwrap_or_default();
        let key = (model_type, family);
        let removed = {
            let mut registry = lock(&self.inner);
            match registry.get(&key) {
                Some(entry) if entry.instance_id() == holder.ptr_id() => {
                    registry.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::debug!(state = short_type_name::<S>(), "holder removed");
            holder.dispose();
        }
        removed
    }

    /// Unregister and dispose every holder.
    pub fn clear(&self) {
        let drained: Vec<Arc<dyn AnyHolder>> = {
            let mut registry = lock(&self.inner);
            registry.drain().map(|(_, holder)| holder).collect()
        };
        for holder in drained {
            holder.dispose_erased();
        }
    }

    /// Dispatch a fresh action from `factory` to every holder whose state
    /// type is compatible with the action's. Incompatible holders are
    /// skipped without error. Returns the number of dispatches issued.
    pub fn broadcast(&self, factory: impl Fn() -> Box<dyn AnyAction>) -> usize {
        let holders: Vec<Arc<dyn AnyHolder>> = lock(&self.inner).values().cloned().collect();
        let mut dispatched = 0;
        for holder in holders {
            let action = factory();
            if action.state_type() != holder.state_type() {
                tracing::debug!(
                    action = action.action_name(),
                    holder = holder.state_name(),
                    "broadcast skipped incompatible holder"
                );
                continue;
            }
            match holder.accept(action) {
                Ok(()) => dispatched += 1,
                Err(error) => tracing::debug!(%error, "broadcast dispatch failed"),
            }
        }
        dispatched
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("holders", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, Flow};

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

    #[derive(Clone, PartialEq, Debug, Default)]
    struct LabelState {
        text: String,
    }

    #[derive(Default)]
    struct Label;

    impl Model for Label {
        type State = LabelState;

        fn initial(&self) -> LabelState {
            LabelState::default()
        }
    }

    struct Bump;

    impl Action for Bump {
        type State = CounterState;
        type Output = ();

        fn run(&self, ctx: ActionContext<CounterState>) -> Flow<()> {
            ctx.mutate(|state| state.count += 1);
            Flow::now(())
        }
    }

    #[tokio::test]
    async fn test_resolve_returns_singleton() {
        let resolver = Resolver::new();

        let first = resolver.resolve(Counter::default);
        first.set_state(CounterState { count: 9 });

        let second = resolver.resolve(Counter::default);
        assert_eq!(second.state().count, 9);
        assert_eq!(resolver.len(), 1);
    }

    #[tokio::test]
    async fn test_families_are_independent() {
        let resolver = Resolver::new();

        let a = resolver.resolve_keyed(Counter::default, "a");
        let b = resolver.resolve_keyed(Counter::default, "b");

        a.set_state(CounterState { count: 1 });
        assert_eq!(b.state().count, 0);
        assert_eq!(resolver.len(), 2);
        assert!(resolver.contains::<Counter>("a"));
        assert!(!resolver.contains::<Counter>("c"));
    }

    #[tokio::test]
    async fn test_remove_unregisters_and_disposes() {
        let resolver = Resolver::new();
        let holder = resolver.resolve(Counter::default);

        assert!(resolver.remove(&holder));
        assert!(holder.is_disposed());
        assert!(resolver.is_empty());

        // Gone from the registry: a fresh resolve builds a new instance.
        let again = resolver.resolve(Counter::default);
        assert!(!again.is_disposed());
    }

    #[tokio::test]
    async fn test_remove_of_unregistered_holder_is_noop() {
        let resolver = Resolver::new();
        let foreign = Holder::new(Counter);

        assert!(!resolver.remove(&foreign));
    }

    #[tokio::test]
    async fn test_broadcast_skips_incompatible_holders() {
        let resolver = Resolver::new();
        let a = resolver.resolve_keyed(Counter::default, "a");
        let b = resolver.resolve_keyed(Counter::default, "b");
        let label = resolver.resolve(Label::default);

        let dispatched = resolver.broadcast(|| Box::new(Bump));

        assert_eq!(dispatched, 2);
        assert_eq!(a.state().count, 1);
        assert_eq!(b.state().count, 1);
        assert_eq!(label.state().text, "");
    }

    #[tokio::test]
    async fn test_dispatch_any_incompatible_is_loud() {
        let label = Holder::new(Label);

        let result = label.dispatch_any(Box::new(Bump));

        assert!(matches!(
            result,
            Err(DispatchError::IncompatibleState { action: "Bump", .. })
        ));
        assert_eq!(label.state().text, "");
    }

    #[tokio::test]
    async fn test_clear_disposes_everything() {
        let resolver = Resolver::new();
        let a = resolver.resolve_keyed(Counter::default, "a");
        let label = resolver.resolve(Label::default);

        resolver.clear();

        assert!(resolver.is_empty());
        assert!(a.is_disposed());
        assert!(label.is_disposed());
    }
}
