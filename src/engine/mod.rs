//! Engine orchestrator and public API
//!
//! This module provides the main `Engine` struct that owns all subsystems
//! (entity store, reconciler, refresh scheduler, notifier) and exposes the
//! consumer-facing query and action interface. Everything is explicitly
//! constructed and injected; there are no ambient registries, so isolated
//! engine instances can coexist in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

// Submodules
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod refresh;
pub mod store;
pub mod transport;

pub use error::{Result, SyncError, TransportError, UserActionError};
pub use model::{
    Command, CommandId, CommandStatus, CommandUpdate, Device, DeviceId, DeviceStatus,
    DeviceUpdate, Priority, Seq,
};
pub use notify::{Alert, Severity};
pub use reconcile::{ChannelState, IngestOutcome};
pub use refresh::TickOutcome;
pub use store::{ChangeEvent, FleetStats, PutOutcome};
pub use transport::{CommandRequest, DeviceRecord, PushEvent, Transport};

use notify::Notifier;
use reconcile::Reconciler;
use refresh::RefreshScheduler;
use store::EntityStore;

/// Configuration for the synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between fallback poll ticks while degraded
    pub refresh_interval: Duration,

    /// Deadline applied to each poll request
    pub poll_timeout: Duration,

    /// Per-entity alert coalescing window
    pub coalesce_window: Duration,

    /// Visible lifetime of an alert
    pub alert_lifetime: Duration,

    /// Maximum number of visible alerts (oldest evicted first)
    pub alert_capacity: usize,

    /// Capacity of the change-feed broadcast channel
    pub feed_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(10),
            coalesce_window: Duration::from_secs(3),
            alert_lifetime: Duration::from_secs(5),
            alert_capacity: 100,
            feed_capacity: 256,
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// The synchronization engine
///
/// Maintains the canonical in-memory mirror of devices and commands, merges
/// push events, poll snapshots, and optimistic local actions, and exposes a
/// consistent queryable view.
pub struct Engine {
    config: EngineConfig,
    store: EntityStore,
    reconciler: Reconciler,
    scheduler: RefreshScheduler,
    notifier: Notifier,
    /// The notifier's subscription to the store's change feed
    feed_rx: broadcast::Receiver<ChangeEvent>,
}

impl Engine {
    /// Create an engine with the given configuration
    ///
    /// The push channel starts degraded; the transport adapter confirms the
    /// connection via [`connection_established`].
    ///
    /// [`connection_established`]: Engine::connection_established
    pub fn new(config: EngineConfig) -> Self {
        let store = EntityStore::new(config.feed_capacity);
        let feed_rx = store.subscribe();
        let scheduler = RefreshScheduler::new(config.refresh_interval, config.poll_timeout);
        let notifier = Notifier::new(
            config.alert_capacity,
            chrono_duration(config.coalesce_window),
            chrono_duration(config.alert_lifetime),
        );
        let mut engine = Self {
            config,
            store,
            reconciler: Reconciler::new(),
            scheduler,
            notifier,
            feed_rx,
        };
        engine.scheduler.activate();
        engine
    }

    /// Current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- ingestion surface (called by the transport adapter / driver) ----

    /// Ingest one push event
    ///
    /// Rejections are non-fatal: an illegal transition or malformed payload
    /// is logged once and returned; the store is untouched and the engine
    /// remains queryable.
    pub fn handle_push_event(&mut self, event: PushEvent) -> Result<IngestOutcome> {
        let outcome = self.reconciler.ingest(&mut self.store, event);
        if let Err(e) = &outcome {
            match e {
                SyncError::InvalidTransition(err) => tracing::warn!(error = %err, "update dropped"),
                SyncError::MalformedPayload(err) => tracing::warn!(error = %err, "update discarded"),
                _ => {}
            }
        }
        self.pump_notifications();
        outcome
    }

    /// Record push channel recovery
    ///
    /// Suspends the fallback scheduler and returns true when the caller must
    /// issue one gap-fill poll before resuming normal processing.
    pub fn connection_established(&mut self) -> bool {
        let needs_gap_fill = self.reconciler.connection_established();
        self.scheduler.suspend();
        if needs_gap_fill {
            self.scheduler.begin_poll()
        } else {
            false
        }
    }

    /// Record push channel loss; the fallback scheduler takes over
    pub fn connection_lost(&mut self) {
        self.reconciler.connection_lost();
        self.scheduler.activate();
    }

    /// Resolve a fallback timer tick
    pub fn scheduler_tick(&mut self) -> TickOutcome {
        self.scheduler.on_tick()
    }

    /// Merge a completed poll snapshot
    ///
    /// Releases the in-flight poll slot and replays any pushes buffered
    /// during a gap-fill. Returns the number of entries that changed state.
    pub fn handle_poll_result(&mut self, devices: Vec<DeviceRecord>) -> usize {
        self.scheduler.poll_finished();
        let applied = self.reconciler.apply_snapshot(&mut self.store, devices);
        self.pump_notifications();
        applied
    }

    /// Record a failed or timed-out poll
    ///
    /// No immediate retry is issued; the next scheduled tick retries.
    /// Transport errors surface only through [`connection_state`], never as
    /// per-update alerts.
    ///
    /// [`connection_state`]: Engine::connection_state
    pub fn handle_poll_error(&mut self, error: TransportError) {
        tracing::warn!(error = %error, "poll request failed");
        self.scheduler.poll_finished();
        self.reconciler.poll_failed(&mut self.store);
        self.pump_notifications();
    }

    // ---- user actions ----

    /// Optimistically submit a command to the selected device
    ///
    /// Creates a tentative `pending` entry under a locally generated id and
    /// returns it along with the request body the transport adapter should
    /// POST. The tentative entry is reconciled, not re-created, when
    /// [`confirm_submission`] delivers the server-assigned id.
    ///
    /// [`confirm_submission`]: Engine::confirm_submission
    pub fn submit_command(
        &mut self,
        command_type: &str,
        data: serde_json::Value,
        priority: Priority,
    ) -> std::result::Result<(CommandId, CommandRequest), UserActionError> {
        let Some(device_id) = self.store.selected_device_id().cloned() else {
            return Err(UserActionError::NoDeviceSelected);
        };
        self.submit_command_to(device_id, command_type, data, priority)
    }

    /// Optimistically submit a command to an explicit device
    pub fn submit_command_to(
        &mut self,
        device_id: DeviceId,
        command_type: &str,
        data: serde_json::Value,
        priority: Priority,
    ) -> std::result::Result<(CommandId, CommandRequest), UserActionError> {
        if self.store.device(&device_id).is_none() {
            return Err(UserActionError::UnknownDevice(device_id));
        }
        if !matches!(data, serde_json::Value::Object(_) | serde_json::Value::Null) {
            return Err(UserActionError::InvalidParameters(
                "parameters must be a JSON object".to_string(),
            ));
        }
        let tentative = CommandId::tentative();
        let mut update = CommandUpdate::new(tentative.clone());
        update.device_id = Some(device_id.clone());
        update.command_type = Some(command_type.to_string());
        update.parameters = Some(data.clone());
        update.priority = Some(priority);
        update.status = Some(CommandStatus::Pending);
        update.created_at = Some(Utc::now());

        let seq = self.reconciler.allocate_seq();
        // A fresh UUID cannot collide with a stored command; the insert
        // cannot be an illegal transition.
        let _ = self.store.put_command(update, seq);
        self.pump_notifications();

        let request = CommandRequest {
            device_id,
            command_type: command_type.to_string(),
            data,
            priority,
        };
        Ok((tentative, request))
    }

    /// Re-key a tentative command to its server-assigned id
    ///
    /// If a push naming the server id arrived first, the tentative entry is
    /// folded into the authoritative row. Returns false only when the
    /// tentative id is unknown.
    pub fn confirm_submission(&mut self, tentative: &CommandId, server_id: CommandId) -> bool {
        let ok = self.store.rekey_command(tentative, server_id);
        self.pump_notifications();
        ok
    }

    /// Resolve a rejected submission
    ///
    /// The server never accepted the command, so the tentative entry is
    /// transitioned to `cancelled` (the one legal exit from `pending`).
    pub fn submission_failed(&mut self, tentative: &CommandId) {
        let mut update = CommandUpdate::new(tentative.clone());
        update.status = Some(CommandStatus::Cancelled);
        let seq = self.reconciler.allocate_seq();
        if let Err(e) = self.store.put_command(update, seq) {
            tracing::warn!(error = %e, "could not cancel tentative command");
        }
        self.pump_notifications();
    }

    /// Validate a cancellation request for a pending command
    ///
    /// Cancellation is never applied optimistically: this only checks that
    /// the command exists and is still `pending`. The caller sends the
    /// intent to the server; local status moves to `cancelled` only when the
    /// authoritative update arrives through the normal channels.
    pub fn request_cancellation(
        &self,
        id: &CommandId,
    ) -> std::result::Result<(), UserActionError> {
        match self.store.command(id) {
            None => Err(UserActionError::UnknownCommand(id.clone())),
            Some(command) if command.status != CommandStatus::Pending => {
                Err(UserActionError::NotCancellable {
                    command_id: id.clone(),
                    status: command.status,
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// Remove a device after a server-confirmed delete
    pub fn delete_device_confirmed(&mut self, id: &DeviceId) {
        if self.store.remove_device(id) && self.store.selected_device_id() == Some(id) {
            self.store.select_device(None);
        }
        self.pump_notifications();
    }

    /// Set or clear the session-scoped selected-device pointer
    pub fn select_device(&mut self, id: Option<DeviceId>) {
        self.store.select_device(id);
    }

    // ---- queries ----

    /// Look up a device
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.store.device(id)
    }

    /// List devices, optionally filtered
    pub fn devices(&self, predicate: Option<&dyn Fn(&Device) -> bool>) -> Vec<&Device> {
        self.store.devices(predicate)
    }

    /// Look up a command
    pub fn command(&self, id: &CommandId) -> Option<&Command> {
        self.store.command(id)
    }

    /// List commands, optionally filtered
    pub fn commands(&self, predicate: Option<&dyn Fn(&Command) -> bool>) -> Vec<&Command> {
        self.store.commands(predicate)
    }

    /// Resolve the selected-device pointer
    pub fn selected_device(&self) -> Option<&Device> {
        self.store.selected_device()
    }

    /// The raw selected-device pointer (may dangle)
    pub fn selected_device_id(&self) -> Option<&DeviceId> {
        self.store.selected_device_id()
    }

    /// Health of the push channel
    pub fn connection_state(&self) -> ChannelState {
        self.reconciler.connection_state()
    }

    /// Aggregate counts derived from the mirror
    pub fn local_stats(&self) -> FleetStats {
        self.store.local_stats()
    }

    /// Subscribe to the store's change feed
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.subscribe()
    }

    /// Currently visible alerts, oldest first
    pub fn alerts(&self, now: DateTime<Utc>) -> Vec<&Alert> {
        self.notifier.active(now)
    }

    /// Drop expired alerts
    pub fn sweep_alerts(&mut self, now: DateTime<Utc>) {
        self.notifier.sweep(now);
    }

    /// Access the refresh scheduler
    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Mutable access to the refresh scheduler
    pub fn scheduler_mut(&mut self) -> &mut RefreshScheduler {
        &mut self.scheduler
    }

    /// Last engine-wide sequence number handed out
    pub fn last_seq(&self) -> Seq {
        self.reconciler.last_seq()
    }

    /// Drain the change feed into the notifier
    ///
    /// Feed delivery problems (lag, closure) are swallowed: the throttler is
    /// presentation-adjacent and must never affect store correctness.
    fn pump_notifications(&mut self) {
        let now = Utc::now();
        loop {
            match self.feed_rx.try_recv() {
                Ok(event) => {
                    self.notifier.observe(&event, now);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "notifier lagged behind the change feed");
                }
                Err(_) => break,
            }
        }
    }
}
