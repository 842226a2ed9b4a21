//! Header recovery errors

use strata_queue_core::Error;

/// Errors raised while writing headers with recovery.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Storage-level failure
    #[error(transparent)]
    Core(#[from] Error),

    /// The segment is full. Callers roll to the next cycle.
    #[error("End of data at offset {offset}")]
    EndOfData {
        /// Write position when the end was reached
        offset: u64,
    },

    /// The store reported end-of-data right after a recovery commit although
    /// the padding block left room for the header.
    ///
    /// Padding that runs to the end of the segment is reported as
    /// [`RecoveryError::EndOfData`] instead.
    #[error("Unexpected end of data after header recovery at offset {offset}")]
    InvariantViolation {
        /// Offset of the recovered header
        offset: u64,
    },

    /// Recovery kept running into fresh stuck headers
    #[error("Gave up writing header after {attempts} recovery attempts")]
    RetriesExhausted {
        /// Rounds performed
        attempts: u32,
    },

    /// No strategy registered under this tag
    #[error("Unknown recovery strategy tag {0}")]
    UnknownStrategy(u32),

    /// No strategy registered under this name
    #[error("Unknown recovery strategy '{0}'")]
    UnknownStrategyName(String),

    /// A rebuild action passed to recovery failed
    #[error("Recovery action failed: {0}")]
    Action(String),
}

impl RecoveryError {
    /// Wrap a failure from a rebuild action
    pub fn action(msg: impl Into<String>) -> Self {
        RecoveryError::Action(msg.into())
    }

    /// True for the normal segment-full signal
    pub fn is_end_of_data(&self) -> bool {
        matches!(self, RecoveryError::EndOfData { .. })
    }
}

/// Result alias for recovery operations
pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;
