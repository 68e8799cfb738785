//! Publisher boundary: how a holder announces state changes
//!
//! The engine only ever calls [`Publisher::emit`] from the holder's reduce
//! path, and only when the new state actually differs from the old one.
//! Everything else about change notification (view rebuilding, persistence,
//! bridging to a stream) lives behind this trait, so alternate publishers
//! are drop-in substitutions, not engine concerns.

use crate::emitter::{Emitter, Subscription};
use crate::error::ActionError;
use crate::holder::HolderState;

/// Handler registered through [`Publisher::subscribe`].
pub type StateHandler<S> = Box<dyn FnMut(&S) + Send>;

/// Change-notification boundary consumed by each holder.
pub trait Publisher<S: HolderState>: Send + Sync + 'static {
    /// Announce a new state. The holder guarantees `state` differs from the
    /// previously emitted value.
    fn emit(&self, state: &S);

    /// Register a change listener.
    fn subscribe(&self, handler: StateHandler<S>) -> Subscription;

    /// Observe an action body failure. Default: ignore.
    fn on_error(&self, _error: &ActionError) {}
}

/// Default publisher: synchronous fan-out to subscribed callbacks, in
/// registration order.
pub struct CallbackPublisher<S: HolderState> {
    changes: Emitter<S>,
}

impl<S: HolderState> CallbackPublisher<S> {
    /// A publisher with no subscribers yet.
    pub fn new() -> Self {
        Self {
            changes: Emitter::multi(),
        }
    }
}

impl<S: HolderState> Default for CallbackPublisher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: HolderState> Publisher<S> for CallbackPublisher<S> {
    fn emit(&self, state: &S) {
        self.changes.emit(state.clone());
    }

    fn subscribe(&self, mut handler: StateHandler<S>) -> Subscription {
        self.changes.on(move |state| handler(&state))
    }
}

/// Publisher bridging into a [`tokio::sync::watch`] channel, for consumers
/// that want an async view of the state instead of callbacks. Callback
/// subscriptions keep working alongside the channel.
pub struct WatchPublisher<S: HolderState> {
    tx: tokio::sync::watch::Sender<S>,
    changes: Emitter<S>,
}

impl<S: HolderState> WatchPublisher<S> {
    /// A publisher seeded with the holder's initial state.
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(initial);
        Self {
            tx,
            changes: Emitter::multi(),
        }
    }

    /// A fresh receiver observing every state change.
    pub fn receiver(&self) -> tokio::sync::watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// State changes as a [`tokio_stream::Stream`], starting from the
    /// current value.
    #[cfg(feature = "stream")]
    pub fn stream(&self) -> tokio_stream::wrappers::WatchStream<S> {
        tokio_stream::wrappers::WatchStream::new(self.receiver())
    }
}

impl<S: HolderState> Publisher<S> for WatchPublisher<S> {
    fn emit(&self, state: &S) {
        // send only fails with no receivers; the sender side keeps the
        // channel alive for later `receiver()` calls, so ignore it.
        let _ = self.tx.send(state.clone());
        self.changes.emit(state.clone());
    }

    fn subscribe(&self, mut handler: StateHandler<S>) -> Subscription {
        self.changes.on(move |state| handler(&state))
    }
}

/// Forwarding adapter that logs traffic through [`tracing`] and delegates to
/// an inner publisher. Composition stands in for inheritance: wrap any
/// publisher to add observability without touching it.
pub struct TracingPublisher<S: HolderState, P: Publisher<S>> {
    inner: P,
    target: &'static str,
    _marker: std::marker::PhantomData<fn(&S)>,
}

impl<S: HolderState, P: Publisher<S>> TracingPublisher<S, P> {
    /// Wrap `inner`, labelling log lines with `target`.
    pub fn new(target: &'static str, inner: P) -> Self {
        Self {
            inner,
            target,
            _marker: std::marker::PhantomData,
        }
    }

    /// The wrapped publisher.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<S: HolderState, P: Publisher<S>> Publisher<S> for TracingPublisher<S, P> {
    fn emit(&self, state: &S) {
        tracing::trace!(holder = self.target, "state change");
        self.inner.emit(state);
    }

    fn subscribe(&self, handler: StateHandler<S>) -> Subscription {
        self.inner.subscribe(handler)
    }

    fn on_error(&self, error: &ActionError) {
        tracing::debug!(holder = self.target, %error, "action failed");
        self.inner.on_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_callback_publisher_fans_out_in_order() {
        let publisher = CallbackPublisher::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            publisher.subscribe(Box::new(move |state: &i32| {
                seen.lock().unwrap().push((tag, *state));
            }));
        }

        publisher.emit(&1);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 1), ("b", 1)]);
    }

    #[test]
    fn test_callback_publisher_unsubscribe() {
        let publisher = CallbackPublisher::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = {
            let seen = seen.clone();
            publisher.subscribe(Box::new(move |state: &i32| {
                seen.lock().unwrap().push(*state);
            }))
        };

        publisher.emit(&1);
        sub.cancel();
        publisher.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_watch_publisher_feeds_receivers() {
        let publisher = WatchPublisher::new(0);
        let mut rx = publisher.receiver();

        publisher.emit(&5);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), 5);
    }

    #[test]
    fn test_tracing_publisher_forwards() {
        let inner = CallbackPublisher::<i32>::new();
        let publisher = TracingPublisher::new("test", inner);
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            publisher.subscribe(Box::new(move |state: &i32| {
                seen.lock().unwrap().push(*state);
            }));
        }

        publisher.emit(&3);
        publisher.on_error(&ActionError::msg("x"));

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}
