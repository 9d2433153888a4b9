use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Failures reported by a [`crate::ResourceStore`].
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backing store could not be opened at all.
    #[error("storage unavailable at {0}")]
    StorageUnavailable(PathBuf),
    /// The requested entry does not exist.
    #[error("entry not found: {0}")]
    NotFound(String),
    /// Exclusive creation of an entry that already exists.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    /// A directory operation was attempted on a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// A file operation was attempted on a directory.
    #[error("not a file: {0}")]
    NotAFile(String),
    /// The handle was never issued or has already been released.
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    /// The path escapes the store root or is otherwise unusable.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Underlying filesystem failure.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a [`crate::Transport`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or the body could not be read.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,
    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
}

/// Failure of the digest engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("digest engine unavailable: {0}")]
    Unavailable(String),
}

/// Failure raised while running a payload.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The payload ran and reported an error.
    #[error("payload execution failed: {0}")]
    Failed(String),
    /// The executor panicked while running the payload.
    #[error("payload executor panicked: {0}")]
    Panicked(String),
    /// The executor could not be started.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while reconciling, downloading or running a bundle.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// Resource store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Network request failed.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    /// No digest could be computed.
    #[error("hashing unavailable: {0}")]
    HashingUnavailable(String),
    /// The version endpoint answered with something unusable.
    #[error("malformed remote descriptor: {0}")]
    MalformedRemoteDescriptor(String),
    /// The downloaded payload does not match the advertised digest.
    #[error("payload integrity check failed (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Digest advertised by the version endpoint.
        expected: String,
        /// Digest of the bytes actually received.
        actual: String,
    },
    /// Payload execution failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Neither a local artifact nor a fresh download could be run.
    #[error("no executable content: {0}")]
    NoExecutableContent(String),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl From<HashError> for UpdaterError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Unavailable(msg) => UpdaterError::HashingUnavailable(msg),
        }
    }
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// True when the error only says an expected file is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpdaterError::Store(StoreError::NotFound(_)))
    }

    /// Whether the orchestrator may fall back to local content after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            UpdaterError::Store(StoreError::StorageUnavailable(_))
                | UpdaterError::HashingUnavailable(_)
                | UpdaterError::NoExecutableContent(_)
                | UpdaterError::Config(_)
        )
    }
}
