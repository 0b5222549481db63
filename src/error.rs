#![allow(missing_docs)]

use std::{error, fmt};

/// The error type returned by every fallible operation in this crate.
///
/// The interesting part is the [`ErrorKind`], available via [`kind()`];
/// an optional underlying cause is attached where one exists.
///
/// [`kind()`]: Error::kind
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// An unknown error.
    Unknown,

    /// A size, count or threshold argument is out of range for the target
    /// device (for example a read smaller than one sample record, or a poll
    /// threshold not below the buffer capacity).
    InvalidArgument,

    /// The device is exclusively held by another consumer, or the requested
    /// operation is illegal while sampling is enabled.
    ///
    /// Control values and buffer geometry must not change underneath the
    /// interrupt handler, so all `SET_*` commands and buffer resets return
    /// `Busy` until the channel is disabled.
    Busy,

    /// A non-blocking read found no complete sample record ready.
    WouldBlock,

    /// Allocating a sample buffer failed.
    ///
    /// When returned from a buffer resize, the previous buffer is still
    /// intact and fully operable.
    OutOfMemory,

    /// A blocking wait was cancelled before any data arrived.
    ///
    /// The caller should retry; no samples were consumed.
    Interrupted,

    /// The control command is not recognised, or the sampling flavor is not
    /// supported by this CPU.
    Unsupported,
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn error::Error + 'static))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Busy => "device busy or sampling enabled",
            ErrorKind::WouldBlock => "no samples ready",
            ErrorKind::OutOfMemory => "sample buffer allocation failed",
            ErrorKind::Interrupted => "wait interrupted",
            ErrorKind::Unsupported => "unsupported command or capability",
            ErrorKind::Unknown => "unknown error",
        };
        match self.cause {
            Some(ref c) => write!(f, "{}: {}", msg, c),
            None => write!(f, "{}", msg),
        }
    }
}

#[doc(hidden)]
impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind == other.kind
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

pub(crate) fn new_error(kind: ErrorKind) -> Error {
    Error { kind, cause: None }
}

pub(crate) fn error_with_cause(
    kind: ErrorKind,
    cause: impl error::Error + Send + Sync + 'static,
) -> Error {
    Error {
        kind,
        cause: Some(Box::new(cause)),
    }
}
