use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by every stated operation
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("cannot resolve storage location: {0}")]
    Resolve(String),

    #[error("I/O error on {}: {source}", display_path(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("state file {} is invalid; {len} bytes is too short", .path.display())]
    CorruptRecord { path: PathBuf, len: usize },

    #[error("name not bound: {0}")]
    NotBound(String),

    #[error("name not subscribed: {0}")]
    NotSubscribed(String),

    #[error("state file {} kept changing during {attempts} read attempts", .path.display())]
    Busy { path: PathBuf, attempts: u32 },

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("received an event for watch {0} which is not associated with a subscription")]
    UnknownWatch(i32),

    #[error("client already initialized")]
    AlreadyInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<event queue>".to_string(),
    }
}

impl Error {
    /// Wrap an I/O failure on a specific file
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: Some(path.into()),
            source,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io { path: None, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
