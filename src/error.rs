use std::fmt;
use std::io;

/// Error codes reported by enumeration sessions and their backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IOErrorEnum {
    /// The session was already closed.
    Closed,
    /// Another operation is in flight on the session.
    Pending,
    /// A cancellable was triggered.
    Cancelled,
    NotFound,
    Exists,
    NotDirectory,
    PermissionDenied,
    NotSupported,
    InvalidArg,
    InvalidData,
    TimedOut,
    WouldBlock,
    Interrupted,
    UnexpectedEof,
    Failed,
}

#[derive(Debug)]
pub struct EnumeratorError {
    kind: IOErrorEnum,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EnumeratorError {
    pub fn new(kind: IOErrorEnum, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: IOErrorEnum,
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn closed(message: &str) -> Self {
        Self::new(IOErrorEnum::Closed, message)
    }

    pub(crate) fn pending() -> Self {
        Self::new(IOErrorEnum::Pending, "File enumerator has outstanding operation")
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(IOErrorEnum::Cancelled, "Operation was cancelled")
    }

    pub fn kind(&self) -> IOErrorEnum {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == IOErrorEnum::Cancelled
    }
}

impl fmt::Display for EnumeratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EnumeratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &dyn std::error::Error)
    }
}

impl From<io::Error> for EnumeratorError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => IOErrorEnum::NotFound,
            io::ErrorKind::PermissionDenied => IOErrorEnum::PermissionDenied,
            io::ErrorKind::AlreadyExists => IOErrorEnum::Exists,
            io::ErrorKind::WouldBlock => IOErrorEnum::WouldBlock,
            io::ErrorKind::InvalidInput => IOErrorEnum::InvalidArg,
            io::ErrorKind::InvalidData => IOErrorEnum::InvalidData,
            io::ErrorKind::TimedOut => IOErrorEnum::TimedOut,
            io::ErrorKind::Interrupted => IOErrorEnum::Interrupted,
            io::ErrorKind::Unsupported => IOErrorEnum::NotSupported,
            io::ErrorKind::UnexpectedEof => IOErrorEnum::UnexpectedEof,
            _ => IOErrorEnum::Failed,
        };

        Self::with_source(kind, err.to_string(), Box::new(err))
    }
}

pub type EnumeratorResult<T> = Result<T, EnumeratorError>;
