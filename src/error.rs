use serde::{Deserialize, Serialize};

/// A tiller result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A tiller error.
///
/// Compacted and Unavailable are expected log-store signals, not
/// failures: the replication path branches on them (e.g. sending a
/// snapshot instead of entries). Internal invariant violations panic
/// instead of returning errors, since they can only be caused by bugs
/// and must never occur on well-formed input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically when a
    /// forwarded request is dropped on a leader or term change.
    Abort,
    /// The requested log range has been compacted into a snapshot.
    Compacted,
    /// The requested log entry is beyond the end of the log.
    Unavailable,
    /// Invalid data, e.g. corrupt or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed configuration.
    InvalidInput(String),
}

impl std::error::Error for Error {}

/// Allows the error constructor macros to be used in return position.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::Compacted => write!(f, "log range compacted into a snapshot"),
            Error::Unavailable => write!(f, "log entry unavailable"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}
