use serde::{Deserialize, Serialize};

/// A chronolog error. All errors are either surfaced to the caller with a
/// structured reason, retried on a later tick, or -- for anything that could
/// make two nodes disagree on committed state -- treated as fatal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The request was aborted and must be retried, typically because of a
    /// leader change, an election in progress, or node shutdown.
    Abort,
    /// Invalid internal data, e.g. storage corruption or a replicated log
    /// inconsistency. The node must stop serving rather than risk divergence.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed request or a rejected timestamp.
    InvalidInput(String),
    /// An IO error, from disk or network.
    IO(String),
    /// This node is not the leader. Carries the leader URL when known.
    NotLeader { leader: Option<String> },
    /// The configured replication quorum could not be reached in time. The
    /// entry may still commit later.
    QuorumUnreachable,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader { leader: Some(url) } => write!(f, "not the leader, try {url}"),
            Error::NotLeader { leader: None } => write!(f, "not the leader, and no leader known"),
            Error::QuorumUnreachable => write!(f, "replication quorum unreachable"),
        }
    }
}

impl Error {
    /// Returns whether the error is fatal for the node. Persistence and data
    /// integrity errors must halt the node to preserve safety; everything
    /// else is retryable or reported to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidData(_) | Error::IO(_))
    }

    /// A short machine-readable kind, used in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Abort => "no_leader",
            Error::InvalidData(_) => "invalid_data",
            Error::InvalidInput(_) => "invalid_input",
            Error::IO(_) => "io",
            Error::NotLeader { .. } => "not_leader",
            Error::QuorumUnreachable => "quorum_unreachable",
        }
    }
}

/// Constructs an Error::InvalidData via format!(), converted into any type
/// with a From<Error> implementation (typically a Result).
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!(), converted into any type
/// with a From<Error> implementation (typically a Result).
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A chronolog result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows constructing a Result directly from an Error, e.g. via errinput!().
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Abort
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Abort
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal() {
        assert!(Error::InvalidData("corrupt".into()).is_fatal());
        assert!(Error::IO("disk".into()).is_fatal());
        assert!(!Error::Abort.is_fatal());
        assert!(!Error::NotLeader { leader: None }.is_fatal());
        assert!(!Error::QuorumUnreachable.is_fatal());
    }

    #[test]
    fn macros() {
        fn data() -> Result<()> {
            errdata!("bad {}", "entry")
        }
        fn input() -> Result<()> {
            errinput!("bad {}", "request")
        }
        assert_eq!(data(), Err(Error::InvalidData("bad entry".into())));
        assert_eq!(input(), Err(Error::InvalidInput("bad request".into())));
    }
}
