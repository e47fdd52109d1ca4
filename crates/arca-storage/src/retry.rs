use std::fmt;
use std::time::Duration;

use arca_types::error::{ArcaError, Result};

use crate::RetryConfig;

/// Run `f` until it succeeds, fails permanently, or the retry budget is spent.
///
/// Sleeps `delay + jitter` between attempts, doubling the delay up to
/// `retry_max_delay_ms`. Only errors accepted by `is_retryable` are retried.
pub fn with_backoff<T, E: fmt::Display>(
    config: &RetryConfig,
    op_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut f: impl FnMut() -> std::result::Result<T, E>,
) -> std::result::Result<T, E> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if attempt < config.max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    config.max_retries,
                );
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = delay_ms.saturating_mul(2).min(config.retry_max_delay_ms);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry an operation on repository errors classified as transient.
pub fn retry_transient<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl FnMut() -> Result<T>,
) -> Result<T> {
    with_backoff(config, op_name, ArcaError::is_transient, f)
}

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Failure of an HTTP request together with reading its body.
pub enum HttpRetryError {
    /// HTTP-level error (retryable: transport, 429, 5xx).
    Http(Box<ureq::Error>),
    /// Body read I/O error (retryable: connection reset, EOF, ...).
    BodyIo(std::io::Error),
    /// Object sits on an archival tier and needs a restore first.
    Archived(String),
    /// Never retried.
    Permanent(String),
}

impl HttpRetryError {
    pub fn http(e: ureq::Error) -> Self {
        HttpRetryError::Http(Box::new(e))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HttpRetryError::Http(e) => is_retryable_http(e.as_ref()),
            HttpRetryError::BodyIo(e) => is_retryable_io(e),
            HttpRetryError::Archived(_) | HttpRetryError::Permanent(_) => false,
        }
    }

    /// Convert into a repository error, keeping the transient/permanent split
    /// so callers further up can decide whether to try again.
    pub fn into_arca(self, context: &str) -> ArcaError {
        if let HttpRetryError::Archived(key) = self {
            return ArcaError::ColdStorageUnavailable(key);
        }
        if self.is_retryable() {
            ArcaError::Transient(format!("{context}: {self}"))
        } else {
            ArcaError::Other(format!("{context}: {self}"))
        }
    }
}

impl fmt::Display for HttpRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpRetryError::Http(e) => write!(f, "{e}"),
            HttpRetryError::BodyIo(e) => write!(f, "body read error: {e}"),
            HttpRetryError::Archived(key) => write!(f, "{key} is archived"),
            HttpRetryError::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}
