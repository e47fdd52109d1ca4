use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArcaError>;

#[derive(Debug, Error)]
pub enum ArcaError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("decryption failed: wrong password or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("head changed: expected {expected}, found {actual}")]
    HeadChanged { expected: String, actual: String },

    #[error("pack index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("object is in cold storage and must be restored first: {0}")]
    ColdStorageUnavailable(String),

    #[error("invalid blob key: {0}")]
    InvalidBlobKey(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl ArcaError {
    /// Whether retrying the failed operation could succeed.
    ///
    /// Decryption and format errors never qualify: the same bytes would fail
    /// the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            ArcaError::Transient(_) => true,
            ArcaError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// "Not found" is a normal answer for heads, packs and objects; callers
    /// use this to tell it apart from real failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArcaError::NotFound(_))
    }
}
