use thiserror::Error;

/// Errors raised by partitioning, participants, aggregation and scheduling.
///
/// Per-participant errors are collected as failures of that participant and
/// never abort sibling work; round-level errors are recorded in the history.
/// Only setup errors are returned to the caller of a simulation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FederationError {
    /// Dataset length not divisible by the partition count.
    #[error("dataset of {len} samples cannot be split into {parts} equal partitions")]
    SizeMismatch {
        /// Dataset length.
        len: usize,
        /// Requested partition count.
        parts: usize,
    },
    /// Parameter sets whose tensor count or shapes differ.
    #[error("parameter shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Fewer participants than a configured minimum.
    #[error("insufficient participants: {available} available, {required} required")]
    InsufficientParticipants {
        /// Participants available (or surviving) at the check.
        available: usize,
        /// Configured minimum.
        required: usize,
    },
    /// Nothing to aggregate (no contribution, or every weight zero).
    #[error("no weighted contribution to aggregate")]
    EmptyAggregation,
    /// Participant still running when the phase deadline passed.
    #[error("participant {0} did not return before the phase deadline")]
    ParticipantTimeout(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Negative or non-finite aggregation weight.
    #[error("invalid aggregation weight {weight} at contribution {index}")]
    InvalidWeight {
        /// Position of the contribution.
        index: usize,
        /// Offending weight.
        weight: f64,
    },
    /// Identifier not backed by any partition.
    #[error("unknown participant {0}")]
    UnknownParticipant(String),
    /// Local trainer failure.
    #[error("local trainer error: {0}")]
    Trainer(String),
    /// Malformed dataset.
    #[error("dataset error: {0}")]
    Dataset(String),
    /// Participant worker panicked or was torn down.
    #[error("participant {participant} aborted: {reason}")]
    Participant {
        /// Participant id.
        participant: String,
        /// Panic message or join error.
        reason: String,
    },
    /// Strategy configured to reject rounds with any failure.
    #[error("{failures} participant failure(s) rejected by strategy")]
    FailuresRejected {
        /// Number of failures in the phase.
        failures: usize,
    },
}

impl FederationError {
    /// Stable snake-case code used in histories and logs.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ShapeMismatch(_) => "shape_mismatch",
            Self::InsufficientParticipants { .. } => "insufficient_participants",
            Self::EmptyAggregation => "empty_aggregation",
            Self::ParticipantTimeout(_) => "participant_timeout",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidWeight { .. } => "invalid_weight",
            Self::UnknownParticipant(_) => "unknown_participant",
            Self::Trainer(_) => "trainer",
            Self::Dataset(_) => "dataset",
            Self::Participant { .. } => "participant_aborted",
            Self::FailuresRejected { .. } => "failures_rejected",
        }
    }
}
