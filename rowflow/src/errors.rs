//! Error types for the rowflow engine.
//!
//! The taxonomy follows the engine's four error classes: structural wiring
//! errors abort run start, worker-fatal errors stop the run cooperatively,
//! row-level errors are diverted by the error-routing policy, and
//! queue-full/queue-empty are flow control rather than errors.

use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The topology could not be wired.
    #[error("{0}")]
    Wiring(#[from] WiringError),

    /// A stage callback reported an unsuccessful init.
    #[error("stage '{stage}' copy {copy} failed to initialize")]
    InitFailed {
        /// The stage name.
        stage: String,
        /// The copy index.
        copy: usize,
    },

    /// Safe-mode validation rejected a row.
    #[error("safe mode: stage '{stage}' copy {copy}: {message}")]
    SafeMode {
        /// The stage name.
        stage: String,
        /// The copy index.
        copy: usize,
        /// What did not line up.
        message: String,
    },

    /// The modulo partition key could not be resolved or read.
    #[error("stage '{stage}': cannot partition on field '{field}': {message}")]
    PartitionKey {
        /// The stage name.
        stage: String,
        /// The configured key field.
        field: String,
        /// Why resolution failed.
        message: String,
    },

    /// Too many rows were rejected, in absolute count or percentage.
    #[error(
        "stage '{stage}': rejection threshold breached ({rejected} rejected of {read} read)"
    )]
    ThresholdBreached {
        /// The stage name.
        stage: String,
        /// Rows rejected so far.
        rejected: u64,
        /// Rows read so far.
        read: u64,
    },

    /// A stage callback raised a fatal (non row-level) error.
    #[error("stage '{stage}' copy {copy}: {message}")]
    Stage {
        /// The stage name.
        stage: String,
        /// The copy index.
        copy: usize,
        /// The callback's error message.
        message: String,
    },

    /// The run was cancelled before completing.
    #[error("run cancelled: {0}")]
    Cancelled(String),
}

/// Error raised when the topology cannot be bound at run start.
///
/// Wiring errors are fatal and abort before any worker is spawned.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WiringError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl WiringError {
    /// Creates a new wiring error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}
