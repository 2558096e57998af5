// Typed failure classification carried inside `anyhow::Error`.

use thiserror::Error;

/// Why a fetch ended without delivering a complete image.
///
/// Functions return `anyhow::Result`; callers that need to branch on the cause use
/// `err.downcast_ref::<FetchError>()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch aborted")]
    Aborted,
    #[error("fetch coordinator is shut down")]
    Shutdown,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned an empty body")]
    EmptyBody,
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }

    /// Classify an arbitrary error, preserving an embedded `FetchError` when present.
    pub fn classify(err: &anyhow::Error) -> FetchError {
        if let Some(fe) = err.downcast_ref::<FetchError>() {
            return fe.clone();
        }
        if let Some(re) = err.downcast_ref::<reqwest::Error>() {
            if let Some(status) = re.status() {
                return FetchError::Status(status.as_u16());
            }
            return FetchError::Transport(re.to_string());
        }
        if err.downcast_ref::<std::io::Error>().is_some() {
            return FetchError::Transport(format!("{:#}", err));
        }
        FetchError::Other(format!("{:#}", err))
    }
}

/// Failures specific to writing a cache entry.
#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("entry exceeds the per-entry limit of {limit} bytes")]
    EntryTooLarge { limit: u64 },
    #[error("refusing to commit an empty entry")]
    Empty,
    #[error("writer already finished")]
    Finished,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(FetchError::Status(503).is_retryable());
        assert!(FetchError::Status(429).is_retryable());
        assert!(!FetchError::Status(404).is_retryable());
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(!FetchError::Aborted.is_retryable());
        assert!(!FetchError::Shutdown.is_retryable());
    }

    #[test]
    fn test_classify_preserves_fetch_error() {
        let err = anyhow::Error::new(FetchError::Status(404));
        assert_eq!(FetchError::classify(&err), FetchError::Status(404));

        let io = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(FetchError::classify(&io), FetchError::Transport(_)));

        let other = anyhow::anyhow!("boom");
        assert_eq!(FetchError::classify(&other), FetchError::Other("boom".into()));
    }
}
