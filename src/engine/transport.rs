//! Wire shapes and the transport seam
//!
//! Defines the push event payloads consumed by the reconciliation engine and
//! an async [`Transport`] trait covering the REST calls the core issues. The
//! trait is the boundary: no HTTP or socket implementation lives in this
//! crate, and tests substitute in-memory fakes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

use super::error::TransportResult;
use super::model::{
    CommandId, CommandStatus, CommandUpdate, DeviceId, DeviceStatus, DeviceUpdate, Priority,
};
use super::store::FleetStats;

/// Full device payload as delivered by `device_connected` / `device_registered`
/// events and `GET /devices` snapshot entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Opaque stable key
    pub device_id: DeviceId,
    /// Device model name
    #[serde(default)]
    pub model: Option<String>,
    /// Device manufacturer
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Android version string
    #[serde(default)]
    pub android_version: Option<String>,
    /// Android API level
    #[serde(default)]
    pub api_level: Option<u32>,
    /// Connectivity status
    #[serde(default)]
    pub status: Option<DeviceStatus>,
    /// Battery percentage
    #[serde(default)]
    pub battery_level: Option<u8>,
    /// Whether the device is charging
    #[serde(default)]
    pub is_charging: Option<bool>,
    /// Last reported IP address
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Last reported latitude
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Last reported longitude
    #[serde(default)]
    pub longitude: Option<f64>,
    /// When the device was last heard from
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<DeviceRecord> for DeviceUpdate {
    fn from(record: DeviceRecord) -> Self {
        DeviceUpdate {
            device_id: record.device_id,
            model: record.model,
            manufacturer: record.manufacturer,
            android_version: record.android_version,
            api_level: record.api_level,
            status: record.status,
            battery_level: record.battery_level,
            is_charging: record.is_charging,
            ip_address: record.ip_address,
            latitude: record.latitude,
            longitude: record.longitude,
            last_seen: record.last_seen,
        }
    }
}

/// Full command payload as delivered by `new_command` events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Server-assigned command id
    pub command_id: CommandId,
    /// Target device
    pub device_id: DeviceId,
    /// Command type
    pub command_type: String,
    /// Opaque parameter payload
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Dispatch priority
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Status at creation (defaults to pending)
    #[serde(default)]
    pub status: Option<CommandStatus>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<CommandRecord> for CommandUpdate {
    fn from(record: CommandRecord) -> Self {
        CommandUpdate {
            command_id: record.command_id,
            device_id: Some(record.device_id),
            command_type: Some(record.command_type),
            parameters: record.parameters,
            priority: record.priority,
            status: record.status,
            created_at: record.created_at,
            executed_at: None,
            result: None,
            error_message: None,
        }
    }
}

/// Inbound push event
///
/// Tagged exactly as the server emits them. Required fields missing from a
/// payload fail deserialization or are rejected by the reconciler as
/// malformed; the offending update is discarded whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushEvent {
    /// A device connected; carries the full device payload
    DeviceConnected {
        /// Full device payload
        device: DeviceRecord,
    },
    /// A device dropped its connection
    DeviceDisconnected {
        /// Device that disconnected
        device_id: DeviceId,
    },
    /// Partial field refresh for a known device
    DeviceUpdated {
        /// The partial update; unknown devices are not created from this
        #[serde(flatten)]
        update: DeviceUpdate,
    },
    /// A device completed registration; carries the full device payload
    DeviceRegistered {
        /// Full device payload
        device: DeviceRecord,
    },
    /// A command was created server-side
    NewCommand {
        /// Full command payload
        command: CommandRecord,
    },
    /// A command's status changed
    CommandUpdated {
        /// Command the update targets
        command_id: CommandId,
        /// Requested status
        status: CommandStatus,
        /// Result payload, on completion
        #[serde(default)]
        result: Option<serde_json::Value>,
        /// Error description, on failure
        #[serde(default)]
        message: Option<String>,
    },
    /// A device reported executing a command
    CommandExecuted {
        /// Command the report targets
        command_id: CommandId,
        /// Final status; defaults to completed, failed when a message is set
        #[serde(default)]
        status: Option<CommandStatus>,
        /// Result payload
        #[serde(default)]
        result: Option<serde_json::Value>,
        /// Error description
        #[serde(default)]
        error_message: Option<String>,
        /// When execution started
        #[serde(default)]
        executed_at: Option<DateTime<Utc>>,
    },
    /// Liveness ping from a device
    Heartbeat {
        /// Device that pinged
        device_id: DeviceId,
    },
    /// Server-side error report
    Error {
        /// Error description
        message: String,
    },
}

impl PushEvent {
    /// Decode a raw JSON payload into a typed event
    ///
    /// Undecodable payloads become [`MalformedPayloadError`]; the update is
    /// discarded whole and never reaches the store.
    ///
    /// [`MalformedPayloadError`]: super::error::MalformedPayloadError
    pub fn decode(
        value: serde_json::Value,
    ) -> std::result::Result<Self, super::error::MalformedPayloadError> {
        let kind = value
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        serde_json::from_value(value).map_err(|e| super::error::MalformedPayloadError {
            event: kind,
            detail: e.to_string(),
        })
    }
}

/// Request body for `POST /command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Target device
    pub device_id: DeviceId,
    /// Command type
    pub command_type: String,
    /// Opaque parameter payload
    pub data: serde_json::Value,
    /// Dispatch priority
    pub priority: Priority,
}

/// Response body for `POST /command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    /// Server-assigned command id
    pub command_id: CommandId,
}

/// REST calls issued by the core
///
/// Implemented by the embedding application's transport adapter. Futures are
/// `Send` so the driver can run polls as spawned tasks.
pub trait Transport: Send + Sync + 'static {
    /// `GET /devices`: fetch the full authoritative device snapshot
    fn fetch_devices(&self) -> impl Future<Output = TransportResult<Vec<DeviceRecord>>> + Send;

    /// `GET /stats`: fetch server-side aggregate counts
    fn fetch_stats(&self) -> impl Future<Output = TransportResult<FleetStats>> + Send;

    /// `POST /command`: submit a command, returning the assigned id
    fn submit_command(
        &self,
        request: CommandRequest,
    ) -> impl Future<Output = TransportResult<CommandReceipt>> + Send;

    /// `DELETE /device/{id}`: delete a device server-side
    fn delete_device(&self, id: &DeviceId) -> impl Future<Output = TransportResult<()>> + Send;
}
