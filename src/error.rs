use std::fmt::Display;

/// Larch errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid or missing configuration, or a directory entry that does not
    /// belong to the store (e.g. an unparseable partition file name).
    BadConfig(String),
    /// An IO error, wrapping the OS error message.
    Io(String),
    /// A log record with an invalid header: bad type, misaligned length, or
    /// length out of range.
    CorruptRecord(String),
    /// A partition or run file ended before the requested position.
    UnexpectedEof(String),
    /// A partition or run is not present in the catalog.
    NotFound(String),
    /// A conditional latch acquisition failed. Normal control flow; callers
    /// retry or fall back.
    WouldBlock,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadConfig(msg) => write!(f, "bad config: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::CorruptRecord(msg) => write!(f, "corrupt log record: {msg}"),
            Error::UnexpectedEof(msg) => write!(f, "unexpected end of file: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::WouldBlock => write!(f, "latch acquisition would block"),
        }
    }
}

/// Constructs an Error::BadConfig for the given format string.
#[macro_export]
macro_rules! errconfig {
    ($($args:tt)*) => { $crate::error::Error::BadConfig(format!($($args)*)).into() };
}

/// Constructs an Error::CorruptRecord for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptRecord(format!($($args)*)).into() };
}

/// A Larch Result returning Error.
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
