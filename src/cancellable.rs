use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::{EnumeratorError, EnumeratorResult};

thread_local! {
    static CURRENT: RefCell<Vec<Cancellable>> = RefCell::new(Vec::new());
}

/// Cooperative cancellation token shared between a caller and the work it starts.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<CancellableInner>,
}

struct CancellableInner {
    cancelled: Mutex<bool>,
    notify: Notify,
}

impl Cancellable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellableInner {
                cancelled: Mutex::new(false),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.inner.cancelled.lock().unwrap_or_else(|e| {
            tracing::warn!("cancellable state lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn cancel(&self) {
        let mut cancelled = self.state();
        if !*cancelled {
            *cancelled = true;
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state()
    }

    /// Returns a `Cancelled` error if the token has been triggered.
    pub fn check(&self) -> EnumeratorResult<()> {
        if self.is_cancelled() {
            Err(EnumeratorError::cancelled())
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Whether both handles refer to the same token.
    pub fn ptr_eq(&self, other: &Cancellable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Makes this token the current one for the calling thread until the
    /// returned guard is dropped.
    ///
    /// Scopes nest: the innermost live guard wins. Nested work running on
    /// the same thread can find the token through [`Cancellable::current`]
    /// without it being passed down explicitly.
    pub fn push_current(&self) -> CurrentGuard {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        CurrentGuard {
            token: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// The innermost token pushed on this thread, if any.
    pub fn current() -> Option<Cancellable> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }
}

impl Default for Cancellable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scope of a [`Cancellable::push_current`] association.
///
/// Pinned to the thread that created it.
#[must_use = "the cancellable stops being current as soon as the guard is dropped"]
pub struct CurrentGuard {
    token: Cancellable,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if top.ptr_eq(&self.token) => {
                    stack.pop();
                }
                _ => {
                    // Guards dropped out of order; remove our own entry wherever it sits.
                    if let Some(pos) = stack.iter().rposition(|c| c.ptr_eq(&self.token)) {
                        stack.remove(pos);
                    }
                }
            }
        });
    }
}
