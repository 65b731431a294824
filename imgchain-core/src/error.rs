use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why no usable chain could be resolved. Always raised before any target is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("no data files found")]
    NoDataFiles,
    #[error("empty sequence")]
    EmptySequence,
    #[error("sequence must start with full or copy")]
    SequenceStart,
    #[error("chain for disk {0} does not start with a full or copy backup")]
    MissingBase(String),
    #[error("disk {disk}: more than one full or copy backup ({first} and {second})")]
    MultipleBases { disk: String, first: String, second: String },
    #[error("disk {disk}: duplicate link at sequence {seq}")]
    DuplicateLink { disk: String, seq: u32 },
    #[error("disk {disk}: missing incremental link {seq}")]
    MissingLink { disk: String, seq: u32 },
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(u32),
    #[error("unrecognised backup file name: {0}")]
    BadFileName(String),
    #[error("invalid disk filter {pattern:?}: {reason}")]
    BadFilter { pattern: String, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: corrupt stream at byte {position}: {reason}", path.display())]
    CorruptStream { path: PathBuf, position: u64, reason: String },

    #[error(
        "disk {disk}: size mismatch, target is {expected} bytes but {} declares {actual}",
        path.display()
    )]
    SizeMismatch { disk: String, path: PathBuf, expected: u64, actual: u64 },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("disk {disk}: write failed at offset {offset}: {source}")]
    Restore {
        disk: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("disk {disk}: link {index} ({}) failed: {source}", path.display())]
    LinkFailed {
        disk: String,
        index: usize,
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("disk {disk}: cancelled at offset {offset}")]
    Cancelled { disk: String, offset: u64 },

    #[error("target already exists: {}", path.display())]
    TargetExists { path: PathBuf },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stream encode: {0}")]
    Encode(String),

    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, position: u64, reason: impl Into<String>) -> Self {
        Error::CorruptStream { path: path.into(), position, reason: reason.into() }
    }

    /// Innermost error, looking through [`Error::LinkFailed`] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::LinkFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
