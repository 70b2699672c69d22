use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The engine has been closed; no further operations are accepted.
    Closed,
    /// A transaction lost a conflict during read-set validation and has been
    /// rolled back.
    Conflict(String),
    /// Invalid on-disk data: bad version, checksum mismatch, or a length out
    /// of range.
    Corrupt(String),
    /// Invalid user input, typically a key or value that violates the size
    /// limits.
    InvalidInput(String),
    /// An operation was attempted in a state that does not allow it, e.g.
    /// using an inactive transaction or triggering a stopped compactor.
    InvalidState(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "storage engine is closed"),
            Error::Conflict(msg) => write!(f, "transaction conflict: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
