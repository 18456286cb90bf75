//! Error types for the synchronization engine
//!
//! Domain errors use thiserror; anyhow is reserved for the driver boundary.
//! No error in this module is fatal: the engine remains queryable after any
//! individual update failure.

use thiserror::Error;

use super::model::{CommandId, CommandStatus, DeviceId};

/// Top-level synchronization error
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level errors (connect failure, timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Illegal command status transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Inbound update missing a required field
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] MalformedPayloadError),

    /// Locally-initiated action rejected before reaching the store
    #[error("User action error: {0}")]
    UserAction(#[from] UserActionError),
}

/// Transport-level failures
///
/// Recovered by falling back to polling; surfaced only through the
/// connection-state indicator, never as a per-update alert.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the server
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request did not complete within the configured deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Server answered with an error payload
    #[error("Server error: {0}")]
    Server(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Rejected command status transition
///
/// The requested edge is not in the lifecycle legality table; the store is
/// left untouched.
#[derive(Debug, Error)]
#[error("Command {command_id}: illegal transition {from} -> {to}")]
pub struct InvalidTransitionError {
    /// Command whose update was rejected
    pub command_id: CommandId,
    /// Stored status at rejection time
    pub from: CommandStatus,
    /// Requested status
    pub to: CommandStatus,
}

/// Inbound update discarded because the payload was unusable
///
/// Covers missing required fields and undecodable event bodies; the
/// offending update is discarded whole and the store is untouched.
#[derive(Debug, Error)]
#[error("Malformed {event} payload: {detail}")]
pub struct MalformedPayloadError {
    /// Event kind the payload arrived as
    pub event: String,
    /// What was wrong with it
    pub detail: String,
}

/// Locally-initiated action rejected synchronously
///
/// Never reaches the store or the reconciliation pipeline.
#[derive(Debug, Error)]
pub enum UserActionError {
    /// Command submitted with no target device selected
    #[error("No device selected")]
    NoDeviceSelected,

    /// Parameter payload is not a JSON object
    #[error("Invalid parameter payload: {0}")]
    InvalidParameters(String),

    /// Cancellation requested for a command that is not pending
    #[error("Command {command_id} is {status}, only pending commands can be cancelled")]
    NotCancellable {
        /// Command the cancellation targeted
        command_id: CommandId,
        /// Its status at request time
        status: CommandStatus,
    },

    /// Action referenced a command unknown to the mirror
    #[error("Unknown command {0}")]
    UnknownCommand(CommandId),

    /// Action referenced a device unknown to the mirror
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// Result type using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
