use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest unreadable at {}: {reason}", path.display())]
    ManifestUnreadable { path: PathBuf, reason: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn manifest_unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ManifestUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<notify::Error> for IndexerError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}

/// Reason a single report line was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("expected 3 tab-separated fields, found {0}")]
    FieldCount(usize),

    #[error("function identifier does not match path:line:column:signature: {0:?}")]
    Identifier(String),

    #[error("invalid byte count: {0:?}")]
    ByteCount(String),

    #[error("unknown qualifier: {0:?}")]
    UnknownQualifier(String),

    #[error("empty qualifier list")]
    NoQualifiers,
}
