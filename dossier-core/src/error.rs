use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvestigationError {
    /// Worker failure that may succeed on a later attempt.
    #[error("Transient worker error: {0}")]
    TransientWorker(String),

    /// Worker failure recorded against a task. Never fails the phase.
    #[error("Fatal worker error: {0}")]
    FatalWorker(String),

    /// A mutation would break a record invariant.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Delivery gap: events after sequence {after} were dropped ({dropped} lost)")]
    DeliveryGap { after: u64, dropped: u64 },

    #[error("Invalid investigation spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Malformed payload for {capability}: {reason}")]
    MalformedPayload { capability: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InvestigationError {
    /// Errors that move the owning investigation to FAILED. Everything else
    /// is absorbed at the dispatcher/aggregator boundary.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            InvestigationError::ConsistencyViolation(_)
                | InvestigationError::Persistence(_)
        )
    }

    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            InvestigationError::TransientWorker(_)
                | InvestigationError::FatalWorker(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, InvestigationError>;
