use std::fmt;

/// Failure categories the pipeline distinguishes at call sites:
/// configuration errors abort the whole run, network errors either degrade
/// to `None` (text fetches) or fail an awaited batch, filesystem errors are
/// fatal for the affected job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Network,
    Filesystem,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Other,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Config,
            msg: msg.into(),
        }
    }

    pub fn network<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Network,
            msg: msg.into(),
        }
    }

    pub fn filesystem<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Filesystem,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
