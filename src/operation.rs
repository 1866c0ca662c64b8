//! Single-use results of asynchronous enumerator calls
//!
//! Every `*_async` call on a [`FileEnumerator`](crate::FileEnumerator)
//! eventually hands its callback exactly one [`AsyncOperation`]. The
//! operation is tagged with the call that produced it and must be passed by
//! value to the matching `*_finish` call, which consumes it.

use std::any::Any;
use std::fmt;

use crate::error::EnumeratorError;

/// Identifies which call produced an [`AsyncOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationTag {
    NextFiles,
    /// A `next_files_async` request for zero entries.
    NextFilesNoop,
    Close,
    /// An operation produced by a backend's native async implementation.
    Backend(&'static str),
}

enum Payload<T> {
    Empty,
    Files(Vec<T>),
    Backend(Box<dyn Any + Send>),
}

pub struct AsyncOperation<T> {
    tag: OperationTag,
    payload: Payload<T>,
    error: Option<EnumeratorError>,
}

/// Completion callback of an asynchronous enumerator call.
pub type AsyncReadyCallback<T> = Box<dyn FnOnce(AsyncOperation<T>) + Send + 'static>;

impl<T> AsyncOperation<T> {
    pub(crate) fn new(tag: OperationTag) -> Self {
        Self {
            tag,
            payload: Payload::Empty,
            error: None,
        }
    }

    pub(crate) fn failed(tag: OperationTag, error: EnumeratorError) -> Self {
        Self {
            tag,
            payload: Payload::Empty,
            error: Some(error),
        }
    }

    pub(crate) fn with_files(files: Vec<T>) -> Self {
        Self {
            tag: OperationTag::NextFiles,
            payload: Payload::Files(files),
            error: None,
        }
    }

    /// Result of a native backend operation, carrying backend-defined data
    /// that the backend's own finish implementation unpacks again.
    pub fn for_backend(tag: &'static str, data: impl Any + Send) -> Self {
        Self {
            tag: OperationTag::Backend(tag),
            payload: Payload::Backend(Box::new(data)),
            error: None,
        }
    }

    pub fn backend_error(tag: &'static str, error: EnumeratorError) -> Self {
        Self::failed(OperationTag::Backend(tag), error)
    }

    pub fn tag(&self) -> OperationTag {
        self.tag
    }

    /// The error this operation completed with, if any.
    ///
    /// Read-only: the error is handed over by the matching finish call.
    pub fn error(&self) -> Option<&EnumeratorError> {
        self.error.as_ref()
    }

    pub(crate) fn set_error(&mut self, error: EnumeratorError) {
        self.error = Some(error);
    }

    pub(crate) fn take_error(&mut self) -> Option<EnumeratorError> {
        self.error.take()
    }

    /// Unpacks data stored by [`AsyncOperation::for_backend`].
    ///
    /// Returns `None` when the operation carries no backend data or the data
    /// is of another type.
    pub fn into_backend_data<D: Any>(self) -> Option<D> {
        match self.payload {
            Payload::Backend(data) => data.downcast::<D>().ok().map(|data| *data),
            _ => None,
        }
    }

    pub(crate) fn into_files(self) -> Vec<T> {
        match self.payload {
            Payload::Files(files) => files,
            _ => Vec::new(),
        }
    }

    /// Aborts on a finish call that does not match the producing call.
    pub(crate) fn assert_tag(&self, expected: OperationTag, finish: &str) {
        assert!(
            self.tag == expected,
            "{} called with an operation tagged {:?}, expected {:?}",
            finish,
            self.tag,
            expected
        );
    }
}

impl<T> fmt::Debug for AsyncOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Payload::Empty => "empty".to_string(),
            Payload::Files(files) => format!("{} files", files.len()),
            Payload::Backend(_) => "backend data".to_string(),
        };
        f.debug_struct("AsyncOperation")
            .field("tag", &self.tag)
            .field("payload", &payload)
            .field("error", &self.error)
            .finish()
    }
}
