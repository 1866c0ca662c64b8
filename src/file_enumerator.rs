//! Entry enumeration sessions
//!
//! A [`FileEnumerator`] wraps a backend that produces entries one at a time
//! (for example the children of a directory) and exposes them through a
//! GIO-style protocol:
//!
//! - blocking [`next_file`](FileEnumerator::next_file) and [`close`](FileEnumerator::close),
//! - callback-based [`next_files_async`](FileEnumerator::next_files_async) and
//!   [`close_async`](FileEnumerator::close_async), each paired with a `*_finish` call,
//! - awaitable wrappers, a blocking iterator and a batched [`Stream`].
//!
//! At most one operation may be in flight on a session. Anything issued
//! while one is pending fails with [`IOErrorEnum::Pending`]. Once closed, a
//! session stays closed.

mod default_async;

use std::collections::VecDeque;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, Stream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancellable::Cancellable;
use crate::error::{EnumeratorError, EnumeratorResult, IOErrorEnum};
use crate::operation::{AsyncOperation, AsyncReadyCallback, OperationTag};
use crate::scheduler::{default_scheduler, IoScheduler};

/// Primitive, resource-specific half of an enumerator.
///
/// Implementations are driven by [`FileEnumerator`], which guarantees that
/// no two calls overlap and that nothing is called after `close`.
pub trait EnumeratorBackend<T>: Send {
    /// Returns the next entry, or `Ok(None)` at the end of the sequence.
    fn next_file(&mut self, cancellable: Option<&Cancellable>) -> EnumeratorResult<Option<T>>;

    /// Releases the underlying resource.
    fn close(&mut self, cancellable: Option<&Cancellable>) -> EnumeratorResult<()>;

    /// Native asynchronous implementation, if the backend has one.
    ///
    /// Queried once, when the session is created. Without one, async calls
    /// run the blocking primitives on the session's [`IoScheduler`].
    fn native_async(&self) -> Option<Arc<dyn NativeAsyncBackend<T>>> {
        None
    }
}

/// Backend-supplied replacement for the offloaded async implementations.
///
/// The session has already run its guards and marked itself pending
/// before any `*_async` method here is called. `enumerator` is a retained
/// handle that keeps the session alive. Drop it once the operation is over,
/// and never store it inside the backend itself. `callback` must be invoked
/// exactly once, and never from within the `*_async` call.
///
/// Operations handed to the callbacks must be built with
/// [`AsyncOperation::for_backend`] or [`AsyncOperation::backend_error`]
/// using [`next_files_tag`](Self::next_files_tag) and
/// [`close_tag`](Self::close_tag) respectively. The session checks the tag
/// before calling the matching finish method.
pub trait NativeAsyncBackend<T>: Send + Sync {
    /// Tag of the operations produced by `next_files_async`.
    fn next_files_tag(&self) -> &'static str;

    /// Tag of the operations produced by `close_async`. Must differ from
    /// [`next_files_tag`](Self::next_files_tag).
    fn close_tag(&self) -> &'static str;

    fn next_files_async(
        &self,
        enumerator: FileEnumerator<T>,
        count: usize,
        priority: i32,
        cancellable: Option<Cancellable>,
        callback: AsyncReadyCallback<T>,
    );

    fn next_files_finish(
        &self,
        enumerator: &FileEnumerator<T>,
        operation: AsyncOperation<T>,
    ) -> EnumeratorResult<Vec<T>>;

    fn close_async(
        &self,
        enumerator: FileEnumerator<T>,
        priority: i32,
        cancellable: Option<Cancellable>,
        callback: AsyncReadyCallback<T>,
    );

    fn close_finish(
        &self,
        enumerator: &FileEnumerator<T>,
        operation: AsyncOperation<T>,
    ) -> EnumeratorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open { pending: bool },
    Closed,
}

struct SessionState {
    phase: Phase,
    outstanding_error: Option<EnumeratorError>,
}

impl SessionState {
    /// Fails unless the session is open with nothing in flight.
    fn ensure_idle(&self, closed_message: &str) -> EnumeratorResult<()> {
        match self.phase {
            Phase::Closed => Err(EnumeratorError::closed(closed_message)),
            Phase::Open { pending: true } => Err(EnumeratorError::pending()),
            Phase::Open { pending: false } => Ok(()),
        }
    }

    fn set_pending(&mut self, pending: bool) {
        if let Phase::Open { .. } = self.phase {
            self.phase = Phase::Open { pending };
        }
    }

    fn discard_outstanding_error(&mut self) {
        if let Some(err) = self.outstanding_error.take() {
            warn!(error = %err, "discarding deferred enumerator error on close");
        }
    }
}

struct Shared<T> {
    state: Mutex<SessionState>,
    backend: Mutex<Box<dyn EnumeratorBackend<T>>>,
    native: Option<Arc<dyn NativeAsyncBackend<T>>>,
    scheduler: Arc<dyn IoScheduler>,
}

impl<T> Shared<T> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backend(&self) -> MutexGuard<'_, Box<dyn EnumeratorBackend<T>>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        match state.phase {
            Phase::Closed => {}
            Phase::Open { pending: true } => {
                warn!("enumerator dropped with an operation marked pending, not closing backend");
            }
            Phase::Open { pending: false } => {
                state.phase = Phase::Closed;
                let backend = self.backend.get_mut().unwrap_or_else(PoisonError::into_inner);
                match backend.close(None) {
                    Ok(()) => debug!("closed enumerator on drop"),
                    Err(err) => debug!(error = %err, "implicit close of dropped enumerator failed"),
                }
            }
        }
    }
}

/// An enumeration session over a backend producing entries of type `T`.
///
/// Dropping the last handle of a session that was never closed closes the
/// backend, ignoring any error. In-flight async operations hold their own
/// handle, so that close happens only after they complete.
pub struct FileEnumerator<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> FileEnumerator<T> {
    /// Creates an open session that offloads async work to the default scheduler.
    pub fn new(backend: impl EnumeratorBackend<T> + 'static) -> Self {
        Self::with_scheduler(backend, default_scheduler())
    }

    pub fn with_scheduler(
        backend: impl EnumeratorBackend<T> + 'static,
        scheduler: Arc<dyn IoScheduler>,
    ) -> Self {
        let native = backend.native_async();
        let backend: Box<dyn EnumeratorBackend<T>> = Box::new(backend);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    phase: Phase::Open { pending: false },
                    outstanding_error: None,
                }),
                backend: Mutex::new(backend),
                native,
                scheduler,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().phase == Phase::Closed
    }

    pub fn has_pending(&self) -> bool {
        self.shared.lock_state().phase == Phase::Open { pending: true }
    }

    /// Forces the pending flag.
    ///
    /// Meant for native async backends that track their own operations. Has
    /// no effect on a closed session.
    pub fn set_pending(&self, pending: bool) {
        self.shared.lock_state().set_pending(pending);
    }

    pub fn scheduler(&self) -> &Arc<dyn IoScheduler> {
        &self.shared.scheduler
    }

    fn retain(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns information for the next entry, blocking until it is available.
    ///
    /// `Ok(None)` marks the end of the sequence. An error deferred by an
    /// earlier partial batch is returned here, once, before the backend is
    /// consulted again.
    pub fn next_file(&self, cancellable: Option<&Cancellable>) -> EnumeratorResult<Option<T>> {
        {
            let mut state = self.shared.lock_state();
            state.ensure_idle("Enumerator is closed")?;
            if let Some(err) = state.outstanding_error.take() {
                return Err(err);
            }
            state.set_pending(true);
        }

        let result = {
            let _current = cancellable.map(Cancellable::push_current);
            self.shared.lock_backend().next_file(cancellable)
        };

        self.shared.lock_state().set_pending(false);
        result
    }

    /// Releases the backend. Further calls report the session as closed.
    ///
    /// Closing an already closed session succeeds without touching the
    /// backend. The session is closed even if the backend fails, and that
    /// failure is returned.
    pub fn close(&self, cancellable: Option<&Cancellable>) -> EnumeratorResult<()> {
        {
            let mut state = self.shared.lock_state();
            match state.phase {
                Phase::Closed => return Ok(()),
                Phase::Open { pending: true } => return Err(EnumeratorError::pending()),
                Phase::Open { pending: false } => {}
            }
            state.discard_outstanding_error();
            state.set_pending(true);
        }

        let result = {
            let _current = cancellable.map(Cancellable::push_current);
            self.shared.lock_backend().close(cancellable)
        };

        self.shared.lock_state().phase = Phase::Closed;
        if let Err(err) = &result {
            debug!(error = %err, "enumerator backend failed to close");
        }
        result
    }

    /// Requests up to `count` entries without blocking.
    ///
    /// `callback` runs exactly once, on a scheduler thread, never before this
    /// call returns. Pass the operation it receives to
    /// [`next_files_finish`](Self::next_files_finish). Fewer than `count`
    /// entries are returned at the end of the sequence or when an error
    /// interrupts the batch. An error hit after the first entry is reported
    /// by the next call instead, unless it is a cancellation, which is dropped.
    pub fn next_files_async<F>(
        &self,
        count: usize,
        priority: i32,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) where
        F: FnOnce(AsyncOperation<T>) + Send + 'static,
    {
        let callback: AsyncReadyCallback<T> = Box::new(callback);

        if count == 0 {
            self.complete_in_idle(priority, AsyncOperation::new(OperationTag::NextFilesNoop), callback);
            return;
        }

        let rejected = {
            let mut state = self.shared.lock_state();
            match state.ensure_idle("File enumerator is already closed") {
                Err(err) => Some(err),
                Ok(()) => match state.outstanding_error.take() {
                    Some(err) => Some(err),
                    None => {
                        state.set_pending(true);
                        None
                    }
                },
            }
        };
        if let Some(err) = rejected {
            self.complete_in_idle(priority, AsyncOperation::failed(OperationTag::NextFiles, err), callback);
            return;
        }

        debug!(count, priority, "dispatching next_files");
        let callback = self.completion_wrapper(callback, priority, false);
        let cancellable = cancellable.cloned();
        match &self.shared.native {
            Some(native) => native.next_files_async(self.retain(), count, priority, cancellable, callback),
            None => default_async::next_files(self.retain(), count, priority, cancellable, callback),
        }
    }

    /// Completes a [`next_files_async`](Self::next_files_async) call.
    ///
    /// # Panics
    ///
    /// Panics if `operation` was produced by a different call.
    pub fn next_files_finish(&self, mut operation: AsyncOperation<T>) -> EnumeratorResult<Vec<T>> {
        match operation.tag() {
            OperationTag::NextFilesNoop => Ok(Vec::new()),
            OperationTag::NextFiles => default_async::next_files_finish(operation),
            OperationTag::Backend(_) => {
                let native = self.native_backend("next_files_finish");
                operation.assert_tag(OperationTag::Backend(native.next_files_tag()), "next_files_finish");
                if let Some(err) = operation.take_error() {
                    return Err(err);
                }
                native.next_files_finish(self, operation)
            }
            tag => panic!("next_files_finish called with an operation tagged {:?}", tag),
        }
    }

    /// Closes the session without blocking.
    ///
    /// The backend close always runs to completion: `cancellable` is not
    /// consulted, so handles are never leaked. `callback` runs exactly once;
    /// pass its operation to [`close_finish`](Self::close_finish).
    pub fn close_async<F>(&self, priority: i32, cancellable: Option<&Cancellable>, callback: F)
    where
        F: FnOnce(AsyncOperation<T>) + Send + 'static,
    {
        let callback: AsyncReadyCallback<T> = Box::new(callback);

        let rejected = {
            let mut state = self.shared.lock_state();
            match state.ensure_idle("File enumerator is already closed") {
                Err(err) => Some(err),
                Ok(()) => {
                    state.discard_outstanding_error();
                    state.set_pending(true);
                    None
                }
            }
        };
        if let Some(err) = rejected {
            self.complete_in_idle(priority, AsyncOperation::failed(OperationTag::Close, err), callback);
            return;
        }

        debug!(priority, "dispatching close");
        let callback = self.completion_wrapper(callback, priority, true);
        let cancellable = cancellable.cloned();
        match &self.shared.native {
            Some(native) => native.close_async(self.retain(), priority, cancellable, callback),
            None => default_async::close(self.retain(), priority, callback),
        }
    }

    /// Completes a [`close_async`](Self::close_async) call.
    ///
    /// A backend failure is returned as an error, but the session is closed
    /// regardless.
    ///
    /// # Panics
    ///
    /// Panics if `operation` was produced by a different call.
    pub fn close_finish(&self, mut operation: AsyncOperation<T>) -> EnumeratorResult<()> {
        match operation.tag() {
            OperationTag::Close => default_async::close_finish(operation),
            OperationTag::Backend(_) => {
                let native = self.native_backend("close_finish");
                operation.assert_tag(OperationTag::Backend(native.close_tag()), "close_finish");
                if let Some(err) = operation.take_error() {
                    return Err(err);
                }
                native.close_finish(self, operation)
            }
            tag => panic!("close_finish called with an operation tagged {:?}", tag),
        }
    }

    /// Awaitable form of [`next_files_async`](Self::next_files_async).
    ///
    /// An empty vector marks the end of the sequence.
    pub async fn next_files(
        &self,
        count: usize,
        priority: i32,
        cancellable: Option<&Cancellable>,
    ) -> EnumeratorResult<Vec<T>> {
        let (tx, rx) = oneshot::channel();
        self.next_files_async(count, priority, cancellable, move |operation| {
            let _ = tx.send(operation);
        });
        let operation = rx.await.map_err(|_| dropped_operation())?;
        self.next_files_finish(operation)
    }

    /// Awaitable form of [`close_async`](Self::close_async).
    pub async fn close_offloaded(
        &self,
        priority: i32,
        cancellable: Option<&Cancellable>,
    ) -> EnumeratorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.close_async(priority, cancellable, move |operation| {
            let _ = tx.send(operation);
        });
        let operation = rx.await.map_err(|_| dropped_operation())?;
        self.close_finish(operation)
    }

    /// Blocking iterator over the remaining entries.
    ///
    /// Stops after the end of the sequence or the first error.
    pub fn iter<'a>(&'a self, cancellable: Option<&'a Cancellable>) -> Entries<'a, T> {
        Entries {
            enumerator: self,
            cancellable,
            done: false,
        }
    }

    /// Turns the session into a stream that fetches `batch_size` entries at a
    /// time on the session's scheduler.
    ///
    /// The stream ends at the end of the sequence or after yielding an error.
    /// Dropping it drops the session, closing the backend if needed.
    pub fn into_stream(
        self,
        batch_size: usize,
        priority: i32,
        cancellable: Option<Cancellable>,
    ) -> impl Stream<Item = EnumeratorResult<T>> {
        let batch_size = batch_size.max(1);
        stream::unfold(Some((self, VecDeque::new())), move |state| {
            let cancellable = cancellable.clone();
            async move {
                let (enumerator, mut buffered) = state?;
                if buffered.is_empty() {
                    match enumerator
                        .next_files(batch_size, priority, cancellable.as_ref())
                        .await
                    {
                        Ok(batch) => buffered.extend(batch),
                        Err(err) => return Some((Err(err), None)),
                    }
                }
                let entry = buffered.pop_front()?;
                Some((Ok(entry), Some((enumerator, buffered))))
            }
        })
    }

    /// Delivers `operation` from the scheduler rather than the calling frame.
    fn complete_in_idle(&self, priority: i32, operation: AsyncOperation<T>, callback: AsyncReadyCallback<T>) {
        self.shared
            .scheduler
            .submit(priority, Box::new(move |_: Option<&Cancellable>| callback(operation)), None);
    }

    /// Wraps `callback` so the session leaves the pending state (and, for a
    /// close, enters the closed state) before the caller hears about it.
    fn completion_wrapper(&self, callback: AsyncReadyCallback<T>, priority: i32, closes: bool) -> AsyncReadyCallback<T> {
        let completion = Completion {
            enumerator: self.retain(),
            callback: Some(callback),
            priority,
            closes,
        };
        Box::new(move |operation| completion.complete(operation))
    }

    fn native_backend(&self, finish: &str) -> &Arc<dyn NativeAsyncBackend<T>> {
        match &self.shared.native {
            Some(native) => native,
            None => panic!("{} called with a backend operation, but the backend has no native async support", finish),
        }
    }
}

/// Completion of an in-flight operation.
///
/// If it is dropped without being called, for instance because the job
/// running it panicked, the session still leaves the pending state and the
/// caller's callback receives a `Failed` operation from the scheduler.
struct Completion<T: Send + 'static> {
    enumerator: FileEnumerator<T>,
    callback: Option<AsyncReadyCallback<T>>,
    priority: i32,
    closes: bool,
}

impl<T: Send + 'static> Completion<T> {
    fn settle(&self) {
        let mut state = self.enumerator.shared.lock_state();
        if self.closes {
            state.phase = Phase::Closed;
        } else {
            state.set_pending(false);
        }
    }

    fn complete(mut self, operation: AsyncOperation<T>) {
        if let Some(callback) = self.callback.take() {
            self.settle();
            callback(operation);
        }
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        warn!(closes = self.closes, "async enumerator operation abandoned before completing");
        self.settle();
        let tag = if self.closes {
            OperationTag::Close
        } else {
            OperationTag::NextFiles
        };
        let operation = AsyncOperation::failed(
            tag,
            EnumeratorError::new(IOErrorEnum::Failed, "Operation was abandoned before completing"),
        );
        self.enumerator.complete_in_idle(self.priority, operation, callback);
    }
}

fn dropped_operation() -> EnumeratorError {
    EnumeratorError::new(IOErrorEnum::Failed, "Scheduler dropped the operation before completing it")
}

impl<T> fmt::Debug for FileEnumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("FileEnumerator")
            .field("phase", &state.phase)
            .field("deferred_error", &state.outstanding_error.is_some())
            .field("native_async", &self.shared.native.is_some())
            .finish()
    }
}

/// Iterator returned by [`FileEnumerator::iter`].
pub struct Entries<'a, T> {
    enumerator: &'a FileEnumerator<T>,
    cancellable: Option<&'a Cancellable>,
    done: bool,
}

impl<'a, T: Send + 'static> Iterator for Entries<'a, T> {
    type Item = EnumeratorResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.enumerator.next_file(self.cancellable) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a, T: Send + 'static> FusedIterator for Entries<'a, T> {}
