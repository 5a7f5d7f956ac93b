//! Error types for the chainhead tracker.

use thiserror::Error;

/// The retry loop whose budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    /// Re-linking the cache from a common ancestor up to the new block.
    ChainRepair,
    /// Querying logs for the newly accepted range.
    GetLogs,
}

impl std::fmt::Display for RetryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChainRepair => write!(f, "chain repair"),
            Self::GetLogs => write!(f, "log fetch"),
        }
    }
}

/// Errors surfaced by the tracker, its block source and its subscribers.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    #[error("Block {number} not found")]
    BlockNotFound { number: u64 },

    #[error("Retry budget exhausted during {stage} after {attempts} attempts")]
    MaxRetryReach { stage: RetryStage, attempts: u32 },

    #[error("Common ancestor search failed after {attempts} attempts")]
    FailedGetBlock { attempts: u32 },

    #[error("Tracker has not been initialized")]
    NotInitialized,

    #[error("Block source error: {0}")]
    Source(String),

    #[error("Subscriber '{id}' failed: {reason}")]
    Subscriber { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl TrackerError {
    /// Returns `true` if a retry budget was exhausted. The tracker itself stays usable.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::MaxRetryReach { .. } | Self::FailedGetBlock { .. })
    }

    /// Returns `true` if a required block could not be fetched.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BlockNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exhaustion_classification() {
        let e = TrackerError::MaxRetryReach { stage: RetryStage::GetLogs, attempts: 4 };
        assert!(e.is_retry_exhausted());
        assert!(TrackerError::FailedGetBlock { attempts: 2 }.is_retry_exhausted());
        assert!(!TrackerError::BlockNotFound { number: 7 }.is_retry_exhausted());
        assert!(TrackerError::BlockNotFound { number: 7 }.is_not_found());
    }

    #[test]
    fn display_names_stage() {
        let e = TrackerError::MaxRetryReach { stage: RetryStage::ChainRepair, attempts: 3 };
        assert_eq!(e.to_string(), "Retry budget exhausted during chain repair after 3 attempts");
    }
}
