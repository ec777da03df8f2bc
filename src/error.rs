//! Error types for the transfer engine

use std::time::Duration;
use thiserror::Error;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Failure kinds surfaced by the transfer engine.
///
/// Each kind carries a fixed disposition: transient errors are retried with
/// slot-level backoff, fatal ones release the slot and report to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Transient HTTP or network failure
    #[error("transient transfer failure")]
    Again {
        /// The temporary URLs are stale and must be re-fetched before retrying
        needs_url_refresh: bool,
    },

    /// MAC verification failed, after the legacy-recovery scan
    #[error("file integrity check failed")]
    Key,

    /// Server returned HTTP 509; the transfer pauses for the quota window
    #[error("bandwidth quota exceeded")]
    OverQuota {
        /// Server-supplied wait, when present; otherwise the client default applies
        timeleft: Option<Duration>,
    },

    /// Local file read failed during an upload
    #[error("local file read failed: {0}")]
    Read(String),

    /// Local file write failed during a download
    #[error("local file write failed: {0}")]
    Write(String),

    /// Missing upload token, buffer invariant violation, or similar
    #[error("internal transfer error: {0}")]
    Internal(String),

    /// Any other server-reported error
    #[error("server reported failure (http {status})")]
    Failed { status: u16 },
}

impl TransferError {
    /// Plain transient failure keeping the current temporary URLs.
    pub fn again() -> Self {
        TransferError::Again {
            needs_url_refresh: false,
        }
    }

    /// Transient failure that additionally invalidates the temporary URLs.
    pub fn stale_url() -> Self {
        TransferError::Again {
            needs_url_refresh: true,
        }
    }

    /// Whether the engine may retry the transfer after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Again { .. } | TransferError::OverQuota { .. }
        )
    }

    /// Whether this failure counts toward the slot error counter.
    pub fn counts_toward_errorcount(&self) -> bool {
        matches!(self, TransferError::Again { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransferError::again().is_transient());
        assert!(
            TransferError::OverQuota {
                timeleft: Some(Duration::from_secs(30))
            }
            .is_transient()
        );
        assert!(!TransferError::Key.is_transient());
        assert!(!TransferError::Failed { status: 500 }.is_transient());
    }

    #[test]
    fn errorcount_only_counts_transient_network_failures() {
        assert!(TransferError::again().counts_toward_errorcount());
        assert!(!TransferError::OverQuota { timeleft: None }.counts_toward_errorcount());
        assert!(!TransferError::Write("disk full".into()).counts_toward_errorcount());
    }
}
