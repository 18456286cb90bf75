//! Entity types, identifiers, and the logical sequence clock
//!
//! Devices and commands are the two entity kinds mirrored by the engine.
//! Every stored entity carries a `Seq`, the per-entity logical clock used to
//! decide whether an inbound update may overwrite it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque stable key identifying a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a command
///
/// Server-assigned for confirmed commands; locally generated (UUID) for
/// tentative commands awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct CommandId(String);

impl CommandId {
    /// Create a new CommandId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh local id for a tentative command
    pub fn tentative() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-entity monotonic logical clock used to order and merge updates
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Seq(pub u64);

impl Seq {
    /// Clock at zero
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next clock value
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Online/offline state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is connected and reachable
    Online,
    /// Device is not currently connected
    Offline,
}

/// A mirrored device entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque stable key
    pub device_id: DeviceId,
    /// Device model name
    pub model: Option<String>,
    /// Device manufacturer
    pub manufacturer: Option<String>,
    /// Android version string
    pub android_version: Option<String>,
    /// Android API level
    pub api_level: Option<u32>,
    /// Connectivity status
    pub status: DeviceStatus,
    /// Battery percentage, 0-100; `None` when unknown
    pub battery_level: Option<u8>,
    /// Whether the device is currently charging
    pub is_charging: bool,
    /// Last reported IP address
    pub ip_address: Option<String>,
    /// Last reported latitude
    pub latitude: Option<f64>,
    /// Last reported longitude
    pub longitude: Option<f64>,
    /// When the device was last heard from
    pub last_seen: DateTime<Utc>,
    /// Logical clock of the last applied update
    pub seq: Seq,
}

/// Partial device update carried by a push event or a poll snapshot entry
///
/// `None` fields are absent from the update and leave the stored value
/// untouched. The update as a whole is only applied when its seq is strictly
/// greater than the stored one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdate {
    /// Device the update targets
    pub device_id: DeviceId,
    /// New model name, if carried
    #[serde(default)]
    pub model: Option<String>,
    /// New manufacturer, if carried
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// New Android version, if carried
    #[serde(default)]
    pub android_version: Option<String>,
    /// New API level, if carried
    #[serde(default)]
    pub api_level: Option<u32>,
    /// New status, if carried
    #[serde(default)]
    pub status: Option<DeviceStatus>,
    /// New battery level, if carried
    #[serde(default)]
    pub battery_level: Option<u8>,
    /// New charging flag, if carried
    #[serde(default)]
    pub is_charging: Option<bool>,
    /// New IP address, if carried
    #[serde(default)]
    pub ip_address: Option<String>,
    /// New latitude, if carried
    #[serde(default)]
    pub latitude: Option<f64>,
    /// New longitude, if carried
    #[serde(default)]
    pub longitude: Option<f64>,
    /// New last-seen timestamp, if carried
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    /// Empty update targeting a device
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            model: None,
            manufacturer: None,
            android_version: None,
            api_level: None,
            status: None,
            battery_level: None,
            is_charging: None,
            ip_address: None,
            latitude: None,
            longitude: None,
            last_seen: None,
        }
    }
}

/// Dispatch priority of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Default priority
    #[default]
    Normal,
    /// Delivered ahead of normal-priority commands
    High,
}

/// Execution status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Created, not yet delivered to the device
    Pending,
    /// Delivered to the device
    Sent,
    /// Device reported execution start
    Executing,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with an error (terminal)
    Failed,
    /// Cancelled before delivery (terminal)
    Cancelled,
}

impl CommandStatus {
    /// Whether no further status mutation is accepted from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A mirrored command entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command identifier
    pub command_id: CommandId,
    /// Target device; may dangle if the device was removed
    pub device_id: DeviceId,
    /// Open-ended command type, e.g. "location" or "screenshot"
    pub command_type: String,
    /// Opaque parameter payload
    pub parameters: serde_json::Value,
    /// Dispatch priority
    pub priority: Priority,
    /// Current lifecycle status
    pub status: CommandStatus,
    /// When the command was created
    pub created_at: DateTime<Utc>,
    /// When execution started, once it has
    pub executed_at: Option<DateTime<Utc>>,
    /// Result payload, set on completion
    pub result: Option<serde_json::Value>,
    /// Error description, set on failure
    pub error_message: Option<String>,
    /// Logical clock of the last applied update
    pub seq: Seq,
}

/// Partial command update carried by a push event
///
/// A requested `status` is validated against the lifecycle state machine
/// before anything is applied. Field placement rules: `executed_at` is
/// accepted on entry to `executing` or later, `result` only on entry to
/// `completed`, `error_message` only on entry to `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandUpdate {
    /// Command the update targets
    pub command_id: CommandId,
    /// Target device, if carried (required to create a new entry)
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    /// Command type, if carried (required to create a new entry)
    #[serde(default)]
    pub command_type: Option<String>,
    /// Parameter payload, if carried
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Priority, if carried
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Requested status, if carried
    #[serde(default)]
    pub status: Option<CommandStatus>,
    /// Creation timestamp, if carried
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Execution-start timestamp, if carried
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    /// Result payload, if carried
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error description, if carried
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CommandUpdate {
    /// Empty update targeting a command
    pub fn new(command_id: CommandId) -> Self {
        Self {
            command_id,
            device_id: None,
            command_type: None,
            parameters: None,
            priority: None,
            status: None,
            created_at: None,
            executed_at: None,
            result: None,
            error_message: None,
        }
    }
}
