use std::io;
use thiserror::Error;

/// Result alias carrying [`OpenEphysError`].
pub type Result<T> = std::result::Result<T, OpenEphysError>;

/// Errors raised while decoding Open Ephys recordings.
///
/// Every variant is a local, synchronous failure. A decoder that hits one of
/// these discards whatever it had read so far.
#[derive(Error, Debug)]
pub enum OpenEphysError {
    /// An I/O error occurred while reading a file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unsupported file version or malformed file structure
    #[error("Format error: {0}")]
    Format(String),

    /// A record failed its sample-count or marker check
    #[error("Corrupt record {record}: {reason}")]
    CorruptRecord { record: usize, reason: String },

    /// Per-channel files disagree on the number of samples
    #[error("Channel {channel} has {found} samples, expected {expected}")]
    ChannelLengthMismatch {
        channel: usize,
        expected: usize,
        found: usize,
    },

    /// A probe-file channel is not part of the recorded channel set
    #[error("Channel {channel} in channel group {group} is not marked as recorded in the settings")]
    ConfigurationMismatch { channel: u32, group: u32 },

    /// Required settings metadata is absent or ambiguous
    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    /// A spike train violated its shape or time-bound invariants
    #[error("Invalid spike train: {0}")]
    InvalidSpikeTrain(String),

    /// The probe file could not be parsed
    #[error("Probe file error at line {line}: {message}")]
    ProbeParse { line: usize, message: String },

    /// More spikes than the configured capacity
    #[error("Spike file holds more than {limit} spikes")]
    CapacityExceeded { limit: usize },

    /// A caller-supplied argument is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl OpenEphysError {
    pub(crate) fn corrupt(record: usize, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            record,
            reason: reason.into(),
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub(crate) fn missing(msg: impl Into<String>) -> Self {
        Self::MissingMetadata(msg.into())
    }
}
