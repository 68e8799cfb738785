//! Event primitive behind dispatcher lifecycle and state-change fan-out
//!
//! An [`Emitter`] delivers values to registered handlers in registration
//! order. It comes in two modes:
//!
//! - **multi-shot**: every `emit` reaches all currently registered handlers;
//!   registering afterwards only catches future emissions.
//! - **one-shot**: only the first `emit` has any effect. The value is stored,
//!   and a handler registered after the event fired receives the stored value
//!   immediately and synchronously.
//!
//! Dispatcher success/failure/done/detached events are one-shot; a holder's
//! dispatch feed and the default publisher are multi-shot.
//!
//! Handlers always run with no internal lock held, so a handler may freely
//! re-enter the emitter (or the engine) while being delivered to.

use std::sync::{Arc, Mutex, Weak};

use crate::util::lock;

type BoxHandler<T> = Box<dyn FnMut(T) -> bool + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Multi,
    Once,
}

struct EmitterInner<T> {
    mode: Mode,
    /// Stored value of a one-shot emitter that already fired.
    fired: Option<T>,
    /// Set by [`Emitter::clear`]; blocks further emission and registration.
    closed: bool,
    next_id: u64,
    handlers: Vec<(u64, BoxHandler<T>)>,
}

/// Registration-ordered event source. See the module docs for the two modes.
pub struct Emitter<T: Clone + Send + 'static> {
    inner: Arc<Mutex<EmitterInner<T>>>,
}

impl<T: Clone + Send + 'static> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    fn with_mode(mode: Mode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                mode,
                fired: None,
                closed: false,
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// A multi-shot emitter.
    pub fn multi() -> Self {
        Self::with_mode(Mode::Multi)
    }

    /// A one-shot emitter: emits at most once, replays to late subscribers.
    pub fn once() -> Self {
        Self::with_mode(Mode::Once)
    }

    /// Register a handler. Returns a [`Subscription`] that can unregister it.
    ///
    /// On a one-shot emitter that already fired, the handler is invoked
    /// immediately with the stored value and nothing is registered.
    pub fn on(&self, mut handler: impl FnMut(T) + Send + 'static) -> Subscription {
        self.on_filtered(move |value| {
            handler(value);
            true
        })
    }

    /// Register a handler that signals its own removal by returning `false`.
    pub(crate) fn on_filtered(
        &self,
        handler: impl FnMut(T) -> bool + Send + 'static,
    ) -> Subscription {
        let replay = {
            let inner = lock(&self.inner);
            if inner.mode == Mode::Once {
                if let Some(value) = inner.fired.clone() {
                    Some(value)
                } else if inner.closed {
                    // Never fired and never will; registering would only leak.
                    return Subscription::detached();
                } else {
                    None
                }
            } else if inner.closed {
                return Subscription::detached();
            } else {
                None
            }
        };

        if let Some(value) = replay {
            let mut handler = handler;
            handler(value);
            return Subscription::detached();
        }

        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.push((id, Box::new(handler)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                lock(&inner).handlers.retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Deliver `value` to registered handlers in registration order.
    ///
    /// One-shot: a second call is a no-op. Multi-shot: handlers registered
    /// during delivery only catch future emissions.
    pub fn emit(&self, value: T) {
        // Handlers run with the lock released.
        let (once, taken) = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return;
            }
            match inner.mode {
                Mode::Once => {
                    if inner.fired.is_some() {
                        return;
                    }
                    inner.fired = Some(value.clone());
                }
                Mode::Multi => {}
            }
            (inner.mode == Mode::Once, std::mem::take(&mut inner.handlers))
        };

        if once {
            for (_, mut handler) in taken {
                handler(value.clone());
            }
            return;
        }

        let mut kept = Vec::with_capacity(taken.len());
        for (id, mut handler) in taken {
            if handler(value.clone()) {
                kept.push((id, handler));
            }
        }

        let mut inner = lock(&self.inner);
        if !inner.closed {
            // Anything registered mid-delivery landed in `handlers`; survivors
            // predate them, so they go back in front.
            let added = std::mem::take(&mut inner.handlers);
            kept.extend(added);
            inner.handlers = kept;
        }
    }

    /// Drop all handler registrations and block further emission.
    ///
    /// A one-shot emitter keeps its stored value, so late subscribers still
    /// get the replay after `clear`.
    pub fn clear(&self) {
        let dropped = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            std::mem::take(&mut inner.handlers)
        };
        // Handler drop glue (captured resources) runs without the lock held.
        drop(dropped);
    }

    /// Whether a one-shot emitter has fired. Always `false` for multi-shot.
    pub fn has_fired(&self) -> bool {
        lock(&self.inner).fired.is_some()
    }

    /// Number of currently registered handlers.
    pub fn handler_count(&self) -> usize {
        lock(&self.inner).handlers.len()
    }
}

/// Guard for one handler registration.
///
/// Dropping a `Subscription` does **not** unregister the handler;
/// fire-and-forget registration is the common case. Call
/// [`Subscription::cancel`] to unregister explicitly.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing behind it (already delivered or closed).
    pub(crate) fn detached() -> Self {
        Self { cancel: None }
    }

    /// Unregister the handler.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether this subscription still points at a registered handler.
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_multi_shot_delivers_in_registration_order() {
        let emitter = Emitter::<u32>::multi();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            emitter.on(move |value| seen.lock().unwrap().push((tag, value)));
        }

        emitter.emit(1);
        emitter.emit(2);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("a", 1), ("b", 1), ("c", 1), ("a", 2), ("b", 2), ("c", 2)]
        );
    }

    #[test]
    fn test_one_shot_fires_once() {
        let emitter = Emitter::<u32>::once();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        emitter.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(7);
        emitter.emit(8);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(emitter.has_fired());
    }

    #[test]
    fn test_one_shot_replays_to_late_subscriber() {
        let emitter = Emitter::<u32>::once();
        emitter.emit(42);

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        emitter.on(move |value| *g.lock().unwrap() = Some(value));

        // Delivered synchronously during `on`.
        assert_eq!(*got.lock().unwrap(), Some(42));
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_one_shot_replays_after_clear() {
        let emitter = Emitter::<u32>::once();
        emitter.emit(9);
        emitter.clear();

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        emitter.on(move |value| *g.lock().unwrap() = Some(value));
        assert_eq!(*got.lock().unwrap(), Some(9));
    }

    #[test]
    fn test_subscription_cancel_unregisters() {
        let emitter = Emitter::<u32>::multi();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let sub = emitter.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(1);
        sub.cancel();
        emitter.emit(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_removing_handler() {
        let emitter = Emitter::<u32>::multi();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        emitter.on_filtered(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            false
        });

        emitter.emit(1);
        emitter.emit(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_register_during_delivery_misses_current_emission() {
        let emitter = Emitter::<u32>::multi();
        let late_calls = Arc::new(AtomicUsize::new(0));

        let inner_emitter = emitter.clone();
        let late = late_calls.clone();
        emitter.on(move |_| {
            let late = late.clone();
            inner_emitter.on(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        emitter.emit(1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        emitter.emit(2);
        // The handler registered during emission 1 sees emission 2; emission 2
        // also registers another one.
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_blocks_emission() {
        let emitter = Emitter::<u32>::multi();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        emitter.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.clear();
        emitter.emit(1);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
