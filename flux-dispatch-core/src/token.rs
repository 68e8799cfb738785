//! Cooperative cancellation token
//!
//! A [`CancelToken`] is a one-way flag with synchronous subscriber callbacks.
//! Cancellation is monotonic: once cancelled, a token can never be
//! uncancelled. A token may additionally *derive* its cancelled status from
//! an external predicate (for example "the owning holder was disposed"),
//! which lets a dispatch inherit cancellation from its parent scope without
//! explicit propagation wiring.
//!
//! The awaitable side is backed by a [`tokio_util::sync::CancellationToken`],
//! so timer rules can `select!` between the deadline and cancellation.
//! [`CancelToken::until_cancelled`] wakes on explicit [`CancelToken::cancel`]
//! only; predicate-derived cancellation is a polled condition, checked at
//! every cooperative continuation point via [`CancelToken::cancelled`].

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken as RawToken;

use crate::util::lock;

type Guard = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct TokenState {
    fired: bool,
    handlers: Vec<Box<dyn FnOnce() + Send>>,
}

struct TokenInner {
    flag: RawToken,
    guard: Option<Guard>,
    state: Mutex<TokenState>,
}

/// One-way cancel flag with subscriber callbacks. Cheap to clone; clones
/// observe and drive the same underlying token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// A fresh token with no external predicate.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A token whose `cancelled` status is also true whenever `predicate`
    /// reports true, without `cancel` ever being called on it.
    pub fn guarded(predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(predicate)))
    }

    fn build(guard: Option<Guard>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                flag: RawToken::new(),
                guard,
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    /// True if explicitly cancelled or the external predicate reports true.
    pub fn cancelled(&self) -> bool {
        self.inner.flag.is_cancelled()
            || self
                .inner
                .guard
                .as_ref()
                .is_some_and(|predicate| predicate())
    }

    /// Transition to cancelled, firing registered callbacks synchronously in
    /// registration order. Idempotent: repeat calls do nothing.
    pub fn cancel(&self) {
        let handlers = {
            let mut state = lock(&self.inner.state);
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.handlers)
        };
        self.inner.flag.cancel();
        for handler in handlers {
            handler();
        }
    }

    /// Register a cancel callback. If the token is already cancelled
    /// (explicitly or via the predicate), the handler runs immediately and
    /// synchronously instead of being registered.
    pub fn on_cancel(&self, handler: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.inner.state);
            if !state.fired && !self.cancelled() {
                state.handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    /// Wait until [`CancelToken::cancel`] is called. Resolves immediately if
    /// that already happened. Does not observe the external predicate.
    pub async fn until_cancelled(&self) {
        self.inner.flag.cancelled().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.cancelled())
            .field("guarded", &self.inner.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_cancel_fires_handlers_in_order() {
        let token = CancelToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            let seen = seen.clone();
            token.on_cancel(move || seen.lock().unwrap().push(tag));
        }

        token.cancel();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_cancel_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        token.on_cancel(move || r.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_predicate_derives_cancellation() {
        let parent_disposed = Arc::new(AtomicBool::new(false));

        let p = parent_disposed.clone();
        let token = CancelToken::guarded(move || p.load(Ordering::SeqCst));

        assert!(!token.cancelled());
        parent_disposed.store(true, Ordering::SeqCst);
        assert!(token.cancelled());
    }

    #[test]
    fn test_on_cancel_with_true_predicate_runs_immediately() {
        let token = CancelToken::guarded(|| true);
        let ran = Arc::new(AtomicBool::new(false));

        let r = ran.clone();
        token.on_cancel(move || r.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_until_cancelled_wakes_on_cancel() {
        let token = CancelToken::new();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.until_cancelled().await;
            })
        };

        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("timeout")
            .expect("join");
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();
        assert!(token.cancelled());
    }
}
