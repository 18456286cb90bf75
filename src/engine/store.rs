//! Canonical entity store with sequence-gated merge
//!
//! Holds the in-memory mirror of devices and commands plus the session-scoped
//! selected-device pointer. Every mutation is gated on the per-entity logical
//! clock: an update whose seq is not strictly greater than the stored seq is
//! a guaranteed no-op. This makes the merge commutative and idempotent, so
//! the interleaving of push and poll delivery never corrupts state.
//!
//! The store publishes accepted changes on a broadcast feed; delivery
//! failures (no subscribers, lagging receivers) are ignored and never affect
//! store state.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::broadcast;

use super::error::InvalidTransitionError;
use super::lifecycle;
use super::model::{
    Command, CommandId, CommandStatus, CommandUpdate, Device, DeviceId, DeviceStatus,
    DeviceUpdate, Priority, Seq,
};

/// Change published on the store's feed after an accepted mutation
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A device entity was inserted
    DeviceCreated(Device),
    /// An existing device entity was updated
    DeviceUpdated {
        /// The device after the merge
        device: Device,
        /// Whether the online/offline status flipped in this update
        status_changed: bool,
    },
    /// A device entity was removed (server-confirmed delete)
    DeviceRemoved(DeviceId),
    /// A command entity was inserted
    CommandCreated(Command),
    /// An existing command entity was updated
    CommandUpdated(Command),
}

/// Outcome of a put operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Entity was inserted
    Created,
    /// Entity existed and the update was applied
    Updated,
    /// Update's seq did not exceed the stored seq, or the entry could not be
    /// created from a partial update; nothing changed
    Ignored,
}

/// Aggregate counts derived from the mirror
///
/// Matches the counts the dashboard header shows, so the display stays live
/// even while the poll channel is the only source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct FleetStats {
    /// Number of known devices
    pub total_devices: usize,
    /// Number of devices currently online
    pub online_devices: usize,
    /// Number of known commands
    pub total_commands: usize,
    /// Number of commands still pending delivery
    pub pending_commands: usize,
}

/// Canonical mappings `device_id -> Device` and `command_id -> Command`
///
/// Explicitly constructed and owned; injected into the reconciliation engine
/// and notifier rather than ambient, so isolated instances can coexist in
/// tests.
pub struct EntityStore {
    devices: HashMap<DeviceId, Device>,
    commands: HashMap<CommandId, Command>,
    selected: Option<DeviceId>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl EntityStore {
    /// Create an empty store with the given feed capacity
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity);
        Self {
            devices: HashMap::new(),
            commands: HashMap::new(),
            selected: None,
            feed,
        }
    }

    /// Subscribe to the change feed
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        // A send error only means there are no subscribers.
        let _ = self.feed.send(event);
    }

    /// Insert or merge a device
    ///
    /// Inserts when absent; otherwise applies the update's present fields,
    /// but only when `seq` is strictly greater than the stored seq.
    pub fn put_device(&mut self, update: DeviceUpdate, seq: Seq) -> PutOutcome {
        match self.devices.get_mut(&update.device_id) {
            Some(device) => {
                if seq <= device.seq {
                    tracing::debug!(
                        device = %update.device_id,
                        incoming = %seq,
                        stored = %device.seq,
                        "stale device update dropped"
                    );
                    return PutOutcome::Ignored;
                }
                let before = device.status;
                merge_device(device, &update);
                device.seq = seq;
                let status_changed = device.status != before;
                let snapshot = device.clone();
                self.publish(ChangeEvent::DeviceUpdated {
                    device: snapshot,
                    status_changed,
                });
                PutOutcome::Updated
            }
            None => {
                let device = device_from_update(update, seq);
                self.publish(ChangeEvent::DeviceCreated(device.clone()));
                self.devices.insert(device.device_id.clone(), device);
                PutOutcome::Created
            }
        }
    }

    /// Erase a device entry
    ///
    /// No-op without error when absent. Only called for server-confirmed
    /// deletes, never for local-only removal.
    pub fn remove_device(&mut self, id: &DeviceId) -> bool {
        if self.devices.remove(id).is_some() {
            self.publish(ChangeEvent::DeviceRemoved(id.clone()));
            true
        } else {
            false
        }
    }

    /// Insert or merge a command
    ///
    /// The requested status transition is checked against the lifecycle
    /// tracker first; on rejection the store is untouched and the error is
    /// returned instead of a change event. Accepted updates merge under the
    /// same strictly-greater seq gate as devices.
    ///
    /// A new entry can only be created from an update carrying `device_id`
    /// and `command_type`; a partial update naming an unknown command is
    /// ignored.
    pub fn put_command(
        &mut self,
        update: CommandUpdate,
        seq: Seq,
    ) -> Result<PutOutcome, InvalidTransitionError> {
        match self.commands.get_mut(&update.command_id) {
            Some(command) => {
                if seq <= command.seq {
                    tracing::debug!(
                        command = %update.command_id,
                        incoming = %seq,
                        stored = %command.seq,
                        "stale command update dropped"
                    );
                    return Ok(PutOutcome::Ignored);
                }
                if let Some(to) = update.status {
                    lifecycle::validate_transition(&update.command_id, command.status, to)?;
                }
                lifecycle::apply_update(command, &update, Utc::now());
                command.seq = seq;
                let snapshot = command.clone();
                self.publish(ChangeEvent::CommandUpdated(snapshot));
                Ok(PutOutcome::Updated)
            }
            None => {
                let (Some(device_id), Some(command_type)) =
                    (update.device_id.clone(), update.command_type.clone())
                else {
                    tracing::debug!(
                        command = %update.command_id,
                        "partial update for unknown command dropped"
                    );
                    return Ok(PutOutcome::Ignored);
                };
                let command = Command {
                    command_id: update.command_id.clone(),
                    device_id,
                    command_type,
                    parameters: update.parameters.clone().unwrap_or(serde_json::json!({})),
                    priority: update.priority.unwrap_or(Priority::Normal),
                    status: update.status.unwrap_or(CommandStatus::Pending),
                    created_at: update.created_at.unwrap_or_else(Utc::now),
                    executed_at: update.executed_at,
                    result: update.result.clone(),
                    error_message: update.error_message.clone(),
                    seq,
                };
                self.publish(ChangeEvent::CommandCreated(command.clone()));
                self.commands.insert(command.command_id.clone(), command);
                Ok(PutOutcome::Created)
            }
        }
    }

    /// Merge a full poll snapshot of devices
    ///
    /// Each entry is applied as a device update at the given snapshot seq, so
    /// a device already touched by a push update with a higher seq keeps the
    /// pushed fields. Returns the number of entries that changed state.
    pub fn snapshot_merge(&mut self, devices: Vec<DeviceUpdate>, seq: Seq) -> usize {
        devices
            .into_iter()
            .filter(|update| self.put_device(update.clone(), seq) != PutOutcome::Ignored)
            .count()
    }

    /// Look up a device
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// List devices, optionally filtered
    pub fn devices(&self, predicate: Option<&dyn Fn(&Device) -> bool>) -> Vec<&Device> {
        let mut out: Vec<&Device> = match predicate {
            Some(p) => self.devices.values().filter(|d| p(d)).collect(),
            None => self.devices.values().collect(),
        };
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Look up a command
    pub fn command(&self, id: &CommandId) -> Option<&Command> {
        self.commands.get(id)
    }

    /// List commands, optionally filtered
    pub fn commands(&self, predicate: Option<&dyn Fn(&Command) -> bool>) -> Vec<&Command> {
        let mut out: Vec<&Command> = match predicate {
            Some(p) => self.commands.values().filter(|c| p(c)).collect(),
            None => self.commands.values().collect(),
        };
        out.sort_by(|a, b| a.command_id.cmp(&b.command_id));
        out
    }

    /// Set or clear the session-scoped selected-device pointer
    ///
    /// The pointer may dangle; it is resolved lazily by [`selected_device`].
    ///
    /// [`selected_device`]: EntityStore::selected_device
    pub fn select_device(&mut self, id: Option<DeviceId>) {
        self.selected = id;
    }

    /// The raw selected-device pointer
    pub fn selected_device_id(&self) -> Option<&DeviceId> {
        self.selected.as_ref()
    }

    /// Resolve the selected-device pointer against the mirror
    pub fn selected_device(&self) -> Option<&Device> {
        self.selected.as_ref().and_then(|id| self.devices.get(id))
    }

    /// Re-key a tentative command to its server-assigned id
    ///
    /// Reconciles an optimistic submission in place instead of re-creating
    /// it, so later push updates for the server id land on the same entry.
    /// When a push naming the server id won the race and already created the
    /// authoritative row, the tentative entry is folded into it rather than
    /// left standing next to it. Returns false only when the tentative id is
    /// unknown.
    pub fn rekey_command(&mut self, tentative: &CommandId, server_id: CommandId) -> bool {
        let Some(mut command) = self.commands.remove(tentative) else {
            return false;
        };
        if let Some(existing) = self.commands.get_mut(&server_id) {
            if existing.seq < command.seq {
                existing.seq = command.seq;
            }
            let snapshot = existing.clone();
            self.publish(ChangeEvent::CommandUpdated(snapshot));
            return true;
        }
        command.command_id = server_id.clone();
        self.publish(ChangeEvent::CommandUpdated(command.clone()));
        self.commands.insert(server_id, command);
        true
    }

    /// Derive aggregate counts from the mirror
    pub fn local_stats(&self) -> FleetStats {
        FleetStats {
            total_devices: self.devices.len(),
            online_devices: self
                .devices
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count(),
            total_commands: self.commands.len(),
            pending_commands: self
                .commands
                .values()
                .filter(|c| c.status == CommandStatus::Pending)
                .count(),
        }
    }
}

fn merge_device(device: &mut Device, update: &DeviceUpdate) {
    if let Some(model) = &update.model {
        device.model = Some(model.clone());
    }
    if let Some(manufacturer) = &update.manufacturer {
        device.manufacturer = Some(manufacturer.clone());
    }
    if let Some(android_version) = &update.android_version {
        device.android_version = Some(android_version.clone());
    }
    if let Some(api_level) = update.api_level {
        device.api_level = Some(api_level);
    }
    if let Some(status) = update.status {
        device.status = status;
    }
    if let Some(battery_level) = update.battery_level {
        device.battery_level = Some(battery_level.min(100));
    }
    if let Some(is_charging) = update.is_charging {
        device.is_charging = is_charging;
    }
    if let Some(ip_address) = &update.ip_address {
        device.ip_address = Some(ip_address.clone());
    }
    if let Some(latitude) = update.latitude {
        device.latitude = Some(latitude);
    }
    if let Some(longitude) = update.longitude {
        device.longitude = Some(longitude);
    }
    if let Some(last_seen) = update.last_seen {
        device.last_seen = last_seen;
    }
}

fn device_from_update(update: DeviceUpdate, seq: Seq) -> Device {
    Device {
        device_id: update.device_id,
        model: update.model,
        manufacturer: update.manufacturer,
        android_version: update.android_version,
        api_level: update.api_level,
        status: update.status.unwrap_or(DeviceStatus::Offline),
        battery_level: update.battery_level.map(|b| b.min(100)),
        is_charging: update.is_charging.unwrap_or(false),
        ip_address: update.ip_address,
        latitude: update.latitude,
        longitude: update.longitude,
        last_seen: update.last_seen.unwrap_or_else(Utc::now),
        seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn online_update(id: &str, battery: u8) -> DeviceUpdate {
        let mut update = DeviceUpdate::new(DeviceId::new(id));
        update.status = Some(DeviceStatus::Online);
        update.battery_level = Some(battery);
        update
    }

    #[test]
    fn put_device_creates_then_merges() {
        let mut store = EntityStore::new(16);
        assert_eq!(store.put_device(online_update("d1", 40), Seq(1)), PutOutcome::Created);
        assert_eq!(store.put_device(online_update("d1", 55), Seq(2)), PutOutcome::Updated);
        assert_eq!(store.device(&DeviceId::new("d1")).unwrap().battery_level, Some(55));
    }

    #[test]
    fn equal_seq_is_a_no_op() {
        let mut store = EntityStore::new(16);
        store.put_device(online_update("d1", 40), Seq(3));
        assert_eq!(store.put_device(online_update("d1", 99), Seq(3)), PutOutcome::Ignored);
        assert_eq!(store.device(&DeviceId::new("d1")).unwrap().battery_level, Some(40));
    }

    #[test]
    fn partial_update_preserves_other_fields() {
        let mut store = EntityStore::new(16);
        let mut full = online_update("d1", 70);
        full.model = Some("Pixel 8".to_string());
        store.put_device(full, Seq(1));

        let mut partial = DeviceUpdate::new(DeviceId::new("d1"));
        partial.battery_level = Some(65);
        store.put_device(partial, Seq(2));

        let device = store.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.model.as_deref(), Some("Pixel 8"));
        assert_eq!(device.battery_level, Some(65));
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn remove_absent_device_is_silent() {
        let mut store = EntityStore::new(16);
        assert!(!store.remove_device(&DeviceId::new("ghost")));
    }

    #[test]
    fn selected_pointer_may_dangle() {
        let mut store = EntityStore::new(16);
        store.select_device(Some(DeviceId::new("gone")));
        assert!(store.selected_device().is_none());
        assert_eq!(store.selected_device_id().unwrap().as_str(), "gone");
    }

    #[test]
    fn command_creation_requires_full_record() {
        let mut store = EntityStore::new(16);
        let partial = CommandUpdate::new(CommandId::new("c1"));
        assert_eq!(store.put_command(partial, Seq(1)).unwrap(), PutOutcome::Ignored);
        assert!(store.command(&CommandId::new("c1")).is_none());
    }

    #[test]
    fn rejected_transition_leaves_store_untouched() {
        let mut store = EntityStore::new(16);
        let mut create = CommandUpdate::new(CommandId::new("c1"));
        create.device_id = Some(DeviceId::new("d1"));
        create.command_type = Some("location".to_string());
        store.put_command(create, Seq(1)).unwrap();

        let mut bad = CommandUpdate::new(CommandId::new("c1"));
        bad.status = Some(CommandStatus::Completed);
        assert!(store.put_command(bad, Seq(2)).is_err());

        let command = store.command(&CommandId::new("c1")).unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.seq, Seq(1), "seq must not advance on rejection");
    }

    #[test]
    fn rekey_folds_into_existing_server_entry() {
        let mut store = EntityStore::new(16);
        let mut tentative = CommandUpdate::new(CommandId::new("tmp-1"));
        tentative.device_id = Some(DeviceId::new("d1"));
        tentative.command_type = Some("location".to_string());
        store.put_command(tentative, Seq(1)).unwrap();

        // The push naming the server id lands before the POST response.
        let mut pushed = CommandUpdate::new(CommandId::new("srv-9"));
        pushed.device_id = Some(DeviceId::new("d1"));
        pushed.command_type = Some("location".to_string());
        store.put_command(pushed, Seq(2)).unwrap();

        assert!(store.rekey_command(&CommandId::new("tmp-1"), CommandId::new("srv-9")));
        assert!(store.command(&CommandId::new("tmp-1")).is_none());
        assert_eq!(store.commands(None).len(), 1);
        assert_eq!(store.command(&CommandId::new("srv-9")).unwrap().seq, Seq(2));
    }

    #[test]
    fn local_stats_counts() {
        let mut store = EntityStore::new(16);
        store.put_device(online_update("d1", 10), Seq(1));
        let mut offline = DeviceUpdate::new(DeviceId::new("d2"));
        offline.status = Some(DeviceStatus::Offline);
        store.put_device(offline, Seq(2));

        let stats = store.local_stats();
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.online_devices, 1);
    }

    proptest! {
        // Applying the same update twice at the same seq equals applying it once.
        #[test]
        fn device_merge_is_idempotent(battery in 0u8..=100, seq in 1u64..1000) {
            let update = online_update("d1", battery);

            let mut once = EntityStore::new(16);
            once.put_device(update.clone(), Seq(seq));

            let mut twice = EntityStore::new(16);
            twice.put_device(update.clone(), Seq(seq));
            twice.put_device(update, Seq(seq));

            let a = once.device(&DeviceId::new("d1")).unwrap();
            let b = twice.device(&DeviceId::new("d1")).unwrap();
            prop_assert_eq!(a.battery_level, b.battery_level);
            prop_assert_eq!(a.seq, b.seq);
        }

        // Delivery order never matters: the higher seq wins either way.
        #[test]
        fn device_merge_is_commutative(
            b1 in 0u8..=100,
            b2 in 0u8..=100,
            s1 in 1u64..1000,
            s2 in 1u64..1000,
        ) {
            prop_assume!(s1 != s2);
            let u1 = online_update("d1", b1);
            let u2 = online_update("d1", b2);

            let mut forward = EntityStore::new(16);
            forward.put_device(u1.clone(), Seq(s1));
            forward.put_device(u2.clone(), Seq(s2));

            let mut reverse = EntityStore::new(16);
            reverse.put_device(u2, Seq(s2));
            reverse.put_device(u1, Seq(s1));

            let expected = if s1 > s2 { b1 } else { b2 };
            prop_assert_eq!(
                forward.device(&DeviceId::new("d1")).unwrap().battery_level,
                Some(expected)
            );
            prop_assert_eq!(
                reverse.device(&DeviceId::new("d1")).unwrap().battery_level,
                Some(expected)
            );
        }
    }
}
