//! Async operations for backends without a native implementation: the
//! blocking primitives run on the session's scheduler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::FileEnumerator;
use crate::cancellable::Cancellable;
use crate::error::{EnumeratorError, EnumeratorResult, IOErrorEnum};
use crate::operation::{AsyncOperation, AsyncReadyCallback, OperationTag};

// Upper bound on the up-front allocation for a batch.
const BATCH_PREALLOC: usize = 64;

pub(super) fn next_files<T: Send + 'static>(
    enumerator: FileEnumerator<T>,
    count: usize,
    priority: i32,
    cancellable: Option<Cancellable>,
    callback: AsyncReadyCallback<T>,
) {
    let scheduler = Arc::clone(enumerator.scheduler());
    scheduler.submit(
        priority,
        Box::new(move |cancellable: Option<&Cancellable>| {
            let operation = panic::catch_unwind(AssertUnwindSafe(|| read_batch(&enumerator, count, cancellable)))
                .unwrap_or_else(|_| {
                    error!("enumerator backend panicked while reading a batch");
                    AsyncOperation::failed(OperationTag::NextFiles, backend_panicked())
                });
            callback(operation);
        }),
        cancellable,
    );
}

fn read_batch<T: Send + 'static>(
    enumerator: &FileEnumerator<T>,
    count: usize,
    cancellable: Option<&Cancellable>,
) -> AsyncOperation<T> {
    let mut files = Vec::with_capacity(count.min(BATCH_PREALLOC));
    let mut deferred: Option<EnumeratorError> = None;

    {
        let mut backend = enumerator.shared.lock_backend();
        for i in 0..count {
            let step = match cancellable {
                Some(c) => c.check().and_then(|()| backend.next_file(Some(c))),
                None => backend.next_file(None),
            };

            match step {
                Ok(Some(file)) => files.push(file),
                Ok(None) => break,
                Err(err) if i == 0 => {
                    return AsyncOperation::failed(OperationTag::NextFiles, err);
                }
                Err(err) => {
                    if err.is_cancelled() {
                        debug!(collected = i, "batch cancelled after partial results");
                    } else {
                        deferred = Some(err);
                    }
                    break;
                }
            }
        }
    }

    if let Some(err) = deferred {
        debug!(error = %err, collected = files.len(), "deferring batch error to the next call");
        enumerator.shared.lock_state().outstanding_error = Some(err);
    }
    trace!(collected = files.len(), requested = count, "batch complete");
    AsyncOperation::with_files(files)
}

pub(super) fn next_files_finish<T>(mut operation: AsyncOperation<T>) -> EnumeratorResult<Vec<T>> {
    operation.assert_tag(OperationTag::NextFiles, "next_files_finish");
    match operation.take_error() {
        Some(err) => Err(err),
        None => Ok(operation.into_files()),
    }
}

pub(super) fn close<T: Send + 'static>(
    enumerator: FileEnumerator<T>,
    priority: i32,
    callback: AsyncReadyCallback<T>,
) {
    let scheduler = Arc::clone(enumerator.scheduler());
    // Submitted without the caller's cancellable: a close always runs to the
    // end so the underlying handle is released.
    scheduler.submit(
        priority,
        Box::new(move |_: Option<&Cancellable>| {
            let mut operation = AsyncOperation::new(OperationTag::Close);
            let result = panic::catch_unwind(AssertUnwindSafe(|| enumerator.shared.lock_backend().close(None)))
                .unwrap_or_else(|_| {
                    error!("enumerator backend panicked while closing");
                    Err(backend_panicked())
                });
            if let Err(err) = result {
                debug!(error = %err, "enumerator backend failed to close");
                operation.set_error(err);
            }
            callback(operation);
        }),
        None,
    );
}

fn backend_panicked() -> EnumeratorError {
    EnumeratorError::new(IOErrorEnum::Failed, "Enumerator backend panicked")
}

pub(super) fn close_finish<T>(mut operation: AsyncOperation<T>) -> EnumeratorResult<()> {
    operation.assert_tag(OperationTag::Close, "close_finish");
    match operation.take_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
