use thiserror::Error;

use crate::message::{Offset, StreamKey};

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user supplied processors and decoders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Store Unavailable - {0}")]
    StoreUnavailable(String),

    #[error(
        "Stale Commit - {key}: attempted offset {attempted} is behind stored offset {stored}"
    )]
    StaleCommit {
        key: StreamKey,
        stored: Offset,
        attempted: Offset,
    },

    #[error("Partition Unavailable - {0}")]
    PartitionUnavailable(String),

    #[error("Offset Out Of Range - requested {requested}, earliest retained is {earliest}")]
    OffsetOutOfRange { requested: Offset, earliest: Offset },

    #[error("Unregistered Topic - no decoder registered for topic {0:?}")]
    UnregisteredTopic(String),

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Decode Threshold Exceeded - {failures} consecutive decode failures, last at offset {offset}: {reason}")]
    DecodeThresholdExceeded {
        failures: u32,
        offset: Offset,
        reason: String,
    },

    #[error("Process Error - offset {offset} failed after {attempts} attempts: {reason}")]
    Process {
        offset: Offset,
        attempts: u32,
        reason: String,
    },

    #[error("Flush Error - {0}")]
    Flush(String),

    #[error("Flush Threshold Exceeded - {0} consecutive flush failures")]
    FlushThresholdExceeded(u32),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Internal Error - {0}")]
    Internal(String),
}

impl Error {
    /// Whether the component that observed the error should retry it locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::PartitionUnavailable(_)
        )
    }

    /// Short, stable name of the error kind, used in exit reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::StoreUnavailable(_) => "StoreUnavailable",
            Error::StaleCommit { .. } => "StaleCommit",
            Error::PartitionUnavailable(_) => "PartitionUnavailable",
            Error::OffsetOutOfRange { .. } => "OffsetOutOfRange",
            Error::UnregisteredTopic(_) => "UnregisteredTopic",
            Error::Decode(_) => "DecodeError",
            Error::DecodeThresholdExceeded { .. } => "DecodeThresholdExceeded",
            Error::Process { .. } => "ProcessError",
            Error::Flush(_) => "FlushError",
            Error::FlushThresholdExceeded(_) => "FlushThresholdExceeded",
            Error::Config(_) => "ConfigError",
            Error::Metrics(_) => "MetricsError",
            Error::Internal(_) => "InternalError",
        }
    }
}
