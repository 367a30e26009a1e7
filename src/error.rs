use std::fmt::Display;

/// tephradb errors.
///
/// The variants mirror the status taxonomy surfaced at the public API:
/// anything an operation can fail with is one of these kinds, possibly
/// carrying a message naming the file or record involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The database (or a required file) does not exist.
    NotFound(String),
    /// On-disk data failed validation: checksum mismatch, truncated block,
    /// bad magic number, unparseable internal key, comparator mismatch.
    Corruption(String),
    /// A recognized but unsupported construct, e.g. an unknown block
    /// compression tag written by a newer version.
    NotSupported(String),
    /// Options or arguments violate a precondition.
    InvalidArgument(String),
    /// An underlying file-system failure.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl Error {
    /// True for checksum/format failures, the class of error that
    /// `paranoid_checks` escalates and recovery otherwise tolerates.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

/// A tephradb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}
