//! # npio-enumerator - Nepsod Input-Output entry enumerators
//!
//! GIO-inspired enumeration sessions for Rust. A session walks over the
//! entries of some resource (the children of a directory, the rows of a
//! listing) through a backend that only knows how to produce the next entry
//! and how to close itself. The session adds the protocol on top:
//!
//! - **FileEnumerator**: the session. Guards against use after close and
//!   overlapping operations, and closes the backend when dropped.
//! - **EnumeratorBackend**: the resource-specific primitives, optionally
//!   with a native async implementation.
//! - **AsyncOperation**: the tagged, single-use result handed to async callbacks.
//! - **IoScheduler**: the priority worker pool that offloaded operations run on.
//! - **Cancellable**: cooperative cancellation, explicit or thread-current.
//!
//! ## Example
//!
//! ```no_run
//! use npio_enumerator::{Cancellable, EnumeratorBackend, EnumeratorResult, FileEnumerator, PRIORITY_DEFAULT};
//!
//! struct Numbers(std::ops::Range<u32>);
//!
//! impl EnumeratorBackend<u32> for Numbers {
//!     fn next_file(&mut self, cancellable: Option<&Cancellable>) -> EnumeratorResult<Option<u32>> {
//!         if let Some(c) = cancellable {
//!             c.check()?;
//!         }
//!         Ok(self.0.next())
//!     }
//!
//!     fn close(&mut self, _cancellable: Option<&Cancellable>) -> EnumeratorResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> EnumeratorResult<()> {
//! let enumerator = FileEnumerator::new(Numbers(0..100));
//!
//! // Blocking retrieval
//! let first = enumerator.next_file(None)?;
//! assert_eq!(first, Some(0));
//!
//! // Batched retrieval on the I/O scheduler
//! let batch = enumerator.next_files(10, PRIORITY_DEFAULT, None).await?;
//! assert_eq!(batch.len(), 10);
//!
//! enumerator.close_offloaded(PRIORITY_DEFAULT, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod cancellable;
pub mod error;
pub mod file_enumerator;
pub mod operation;
pub mod scheduler;

pub use cancellable::{Cancellable, CurrentGuard};
pub use error::{EnumeratorError, EnumeratorResult, IOErrorEnum};
pub use file_enumerator::{Entries, EnumeratorBackend, FileEnumerator, NativeAsyncBackend};
pub use operation::{AsyncOperation, AsyncReadyCallback, OperationTag};
pub use scheduler::{
    default_scheduler, IoJob, IoScheduler, SchedulerConfig, ThreadPoolScheduler, PRIORITY_DEFAULT,
    PRIORITY_HIGH, PRIORITY_LOW,
};
