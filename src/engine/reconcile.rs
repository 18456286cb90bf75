//! Dual-channel reconciliation
//!
//! Consumes push events and poll snapshots and feeds the entity store
//! through one seq-gated merge path. Each accepted push event is stamped
//! with the next engine-wide sequence number, so arrival order equals
//! sequence order within the push channel. Poll snapshot entries are
//! stamped with the last fully reconciled counter, which is never higher
//! than any concurrently buffered push, so a push that logically follows the
//! snapshot is never shadowed by it.

use chrono::Utc;

use super::error::{MalformedPayloadError, Result, SyncError};
use super::model::{CommandStatus, CommandUpdate, DeviceStatus, DeviceUpdate, Seq};
use super::store::{EntityStore, PutOutcome};
use super::transport::{DeviceRecord, PushEvent};

/// Health of the push channel as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Push channel delivering; periodic polling suppressed
    Healthy,
    /// Push channel down; the auto-refresh scheduler drives polling
    Degraded,
    /// Push channel back after an outage; one gap-fill poll is outstanding
    /// and concurrent pushes are buffered until it lands
    Recovering,
}

/// What became of an ingested push event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Forwarded to the store
    Applied(PutOutcome),
    /// Held back until the outstanding gap-fill poll is merged
    Buffered,
    /// Discarded (stale seq, unknown entity, or informational event)
    Dropped,
}

/// Merges push events and poll snapshots into the entity store
pub struct Reconciler {
    state: ChannelState,
    /// Last engine-wide sequence number handed out
    last_seq: Seq,
    /// Seq granted to entries of the outstanding gap-fill snapshot
    snapshot_seq: Seq,
    /// Pushes received while a gap-fill poll is outstanding
    buffered: Vec<(Seq, PushEvent)>,
}

impl Reconciler {
    /// Create a reconciler; the push channel starts degraded until the
    /// transport adapter confirms a connection
    pub fn new() -> Self {
        Self {
            state: ChannelState::Degraded,
            last_seq: Seq::zero(),
            snapshot_seq: Seq::zero(),
            buffered: Vec::new(),
        }
    }

    /// Current channel state
    pub fn connection_state(&self) -> ChannelState {
        self.state
    }

    /// Last sequence number handed out
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    fn next_seq(&mut self) -> Seq {
        self.last_seq = self.last_seq.next();
        self.last_seq
    }

    /// Hand out the next engine-wide sequence number
    ///
    /// Used by the engine to stamp optimistic local mutations so they merge
    /// under the same comparator as channel-delivered updates.
    pub fn allocate_seq(&mut self) -> Seq {
        self.next_seq()
    }

    /// Record push channel recovery
    ///
    /// Returns true when one gap-fill poll must be issued before normal
    /// processing resumes; pushes arriving meanwhile are buffered.
    pub fn connection_established(&mut self) -> bool {
        match self.state {
            ChannelState::Degraded => {
                tracing::info!("push channel recovered, issuing gap-fill poll");
                self.state = ChannelState::Recovering;
                // The snapshot takes the counter value allocated here, so it
                // outranks everything reconciled before the outage while any
                // push buffered from now on strictly outranks it.
                self.snapshot_seq = self.next_seq();
                true
            }
            ChannelState::Healthy | ChannelState::Recovering => false,
        }
    }

    /// Record push channel loss; the auto-refresh scheduler takes over
    pub fn connection_lost(&mut self) {
        if self.state != ChannelState::Degraded {
            tracing::warn!("push channel lost, falling back to polling");
        }
        self.state = ChannelState::Degraded;
        // Events buffered for an outstanding gap-fill poll keep their seqs
        // and are replayed when the next snapshot lands.
    }

    /// Ingest one push event
    ///
    /// Stamps the event with the next engine-wide seq at acceptance. While a
    /// gap-fill poll is outstanding the event is buffered; otherwise it is
    /// translated and forwarded to the store.
    pub fn ingest(&mut self, store: &mut EntityStore, event: PushEvent) -> Result<IngestOutcome> {
        validate(&event)?;
        let seq = self.next_seq();

        if self.state == ChannelState::Recovering {
            self.buffered.push((seq, event));
            return Ok(IngestOutcome::Buffered);
        }

        self.apply_event(store, seq, event)
    }

    /// Merge a poll snapshot
    ///
    /// Entries are stamped with the last fully reconciled counter, then any
    /// buffered pushes are replayed in seq order. Higher seq wins per
    /// entity, so buffered updates are never shadowed by the snapshot.
    /// Returns the number of snapshot entries that changed state.
    pub fn apply_snapshot(
        &mut self,
        store: &mut EntityStore,
        records: Vec<DeviceRecord>,
    ) -> usize {
        // A gap-fill snapshot keeps the counter captured when the poll was
        // issued so buffered pushes strictly outrank it. The buffer can
        // outlive a mid-recovery disconnect, so the same rule applies while
        // it is non-empty regardless of channel state. A degraded-mode poll
        // with nothing buffered has no racing pushes; allocating here lets
        // each successive poll refresh what the previous one wrote.
        let seq = if self.state == ChannelState::Recovering || !self.buffered.is_empty() {
            self.snapshot_seq
        } else {
            self.next_seq()
        };
        let updates: Vec<DeviceUpdate> = records.into_iter().map(DeviceUpdate::from).collect();
        let applied = store.snapshot_merge(updates, seq);
        tracing::debug!(applied, snapshot_seq = %seq, "poll snapshot merged");

        self.replay_buffered(store);
        if self.state == ChannelState::Recovering {
            self.state = ChannelState::Healthy;
        }
        applied
    }

    /// Record a failed or timed-out poll
    ///
    /// A failed gap-fill poll still resumes push processing: the channel is
    /// healthy and later pushes correct the gap. Buffered events are
    /// replayed so nothing received during recovery is lost.
    pub fn poll_failed(&mut self, store: &mut EntityStore) {
        if self.state == ChannelState::Recovering {
            tracing::warn!("gap-fill poll failed, resuming push processing without it");
            self.replay_buffered(store);
            self.state = ChannelState::Healthy;
        }
    }

    fn replay_buffered(&mut self, store: &mut EntityStore) {
        for (seq, event) in std::mem::take(&mut self.buffered) {
            if let Err(e) = self.apply_event(store, seq, event) {
                tracing::warn!(error = %e, "buffered push event rejected during replay");
            }
        }
    }

    fn apply_event(
        &mut self,
        store: &mut EntityStore,
        seq: Seq,
        event: PushEvent,
    ) -> Result<IngestOutcome> {
        let outcome = match event {
            PushEvent::DeviceConnected { device } | PushEvent::DeviceRegistered { device } => {
                let mut update = DeviceUpdate::from(device);
                update.status.get_or_insert(DeviceStatus::Online);
                update.last_seen.get_or_insert_with(Utc::now);
                self.put_device_filtered(store, update, seq)
            }
            PushEvent::DeviceDisconnected { device_id } => {
                if store.device(&device_id).is_none() {
                    tracing::debug!(device = %device_id, "disconnect for unknown device dropped");
                    return Ok(IngestOutcome::Dropped);
                }
                let mut update = DeviceUpdate::new(device_id);
                update.status = Some(DeviceStatus::Offline);
                update.last_seen = Some(Utc::now());
                self.put_device_filtered(store, update, seq)
            }
            PushEvent::DeviceUpdated { update } => {
                if store.device(&update.device_id).is_none() {
                    tracing::debug!(device = %update.device_id, "update for unknown device dropped");
                    return Ok(IngestOutcome::Dropped);
                }
                self.put_device_filtered(store, update, seq)
            }
            PushEvent::Heartbeat { device_id } => {
                if store.device(&device_id).is_none() {
                    tracing::debug!(device = %device_id, "heartbeat for unknown device dropped");
                    return Ok(IngestOutcome::Dropped);
                }
                let mut update = DeviceUpdate::new(device_id);
                update.last_seen = Some(Utc::now());
                self.put_device_filtered(store, update, seq)
            }
            PushEvent::NewCommand { command } => {
                let update = CommandUpdate::from(command);
                IngestOutcome::Applied(store.put_command(update, seq)?)
            }
            PushEvent::CommandUpdated {
                command_id,
                status,
                result,
                message,
            } => {
                let mut update = CommandUpdate::new(command_id);
                update.status = Some(status);
                update.result = result;
                update.error_message = message;
                IngestOutcome::Applied(store.put_command(update, seq)?)
            }
            PushEvent::CommandExecuted {
                command_id,
                status,
                result,
                error_message,
                executed_at,
            } => {
                let status = status.unwrap_or(if error_message.is_some() {
                    CommandStatus::Failed
                } else {
                    CommandStatus::Completed
                });
                let mut update = CommandUpdate::new(command_id);
                update.status = Some(status);
                update.result = result;
                update.error_message = error_message;
                update.executed_at = executed_at;
                IngestOutcome::Applied(store.put_command(update, seq)?)
            }
            PushEvent::Error { message } => {
                tracing::warn!(message, "server reported an error");
                IngestOutcome::Dropped
            }
        };
        Ok(outcome)
    }

    /// Forward a device update, dropping it early when the stored seq is
    /// already at or past the incoming one (the store enforces the same
    /// gate; this keeps stale events out of the merge path entirely)
    fn put_device_filtered(
        &self,
        store: &mut EntityStore,
        update: DeviceUpdate,
        seq: Seq,
    ) -> IngestOutcome {
        if let Some(stored) = store.device(&update.device_id) {
            if stored.seq >= seq {
                tracing::debug!(device = %update.device_id, "duplicate push event filtered");
                return IngestOutcome::Dropped;
            }
        }
        IngestOutcome::Applied(store.put_device(update, seq))
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(event: &PushEvent) -> std::result::Result<(), SyncError> {
    let malformed = |kind: &str, detail: &str| {
        Err(SyncError::MalformedPayload(MalformedPayloadError {
            event: kind.to_string(),
            detail: detail.to_string(),
        }))
    };
    match event {
        PushEvent::DeviceConnected { device } | PushEvent::DeviceRegistered { device } => {
            if device.device_id.as_str().is_empty() {
                return malformed("device_connected", "empty device_id");
            }
        }
        PushEvent::DeviceDisconnected { device_id } | PushEvent::Heartbeat { device_id } => {
            if device_id.as_str().is_empty() {
                return malformed("device_disconnected", "empty device_id");
            }
        }
        PushEvent::DeviceUpdated { update } => {
            if update.device_id.as_str().is_empty() {
                return malformed("device_updated", "empty device_id");
            }
        }
        PushEvent::NewCommand { command } => {
            if command.command_id.as_str().is_empty() {
                return malformed("new_command", "empty command_id");
            }
            if command.device_id.as_str().is_empty() {
                return malformed("new_command", "empty device_id");
            }
        }
        PushEvent::CommandUpdated { command_id, .. }
        | PushEvent::CommandExecuted { command_id, .. } => {
            if command_id.as_str().is_empty() {
                return malformed("command_updated", "empty command_id");
            }
        }
        PushEvent::Error { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::DeviceId;

    fn record(id: &str, battery: Option<u8>) -> DeviceRecord {
        DeviceRecord {
            device_id: DeviceId::new(id),
            model: None,
            manufacturer: None,
            android_version: None,
            api_level: None,
            status: Some(DeviceStatus::Online),
            battery_level: battery,
            is_charging: None,
            ip_address: None,
            latitude: None,
            longitude: None,
            last_seen: None,
        }
    }

    #[test]
    fn push_events_get_monotonic_seqs() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        rec.connection_established();
        rec.apply_snapshot(&mut store, vec![]);

        rec.ingest(&mut store, PushEvent::DeviceConnected { device: record("d1", None) })
            .unwrap();
        rec.ingest(&mut store, PushEvent::DeviceConnected { device: record("d2", None) })
            .unwrap();

        let s1 = store.device(&DeviceId::new("d1")).unwrap().seq;
        let s2 = store.device(&DeviceId::new("d2")).unwrap().seq;
        assert!(s2 > s1);
    }

    #[test]
    fn recovering_buffers_until_snapshot() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        assert!(rec.connection_established());
        assert_eq!(rec.connection_state(), ChannelState::Recovering);

        let outcome = rec
            .ingest(&mut store, PushEvent::DeviceConnected { device: record("d1", Some(55)) })
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Buffered);
        assert!(store.device(&DeviceId::new("d1")).is_none());

        rec.apply_snapshot(&mut store, vec![record("d1", Some(40))]);
        assert_eq!(rec.connection_state(), ChannelState::Healthy);
        // Buffered push has the higher seq and wins.
        assert_eq!(store.device(&DeviceId::new("d1")).unwrap().battery_level, Some(55));
    }

    #[test]
    fn malformed_event_is_discarded_whole() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        let err = rec
            .ingest(&mut store, PushEvent::Heartbeat { device_id: DeviceId::new("") })
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedPayload(_)));
    }

    #[test]
    fn heartbeat_for_unknown_device_is_dropped() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        let outcome = rec
            .ingest(&mut store, PushEvent::Heartbeat { device_id: DeviceId::new("ghost") })
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped);
    }

    #[test]
    fn disconnect_during_recovery_does_not_shadow_buffered_pushes() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        rec.connection_established();
        rec.ingest(&mut store, PushEvent::DeviceConnected { device: record("d1", Some(55)) })
            .unwrap();

        // The channel drops again before the gap-fill response lands.
        rec.connection_lost();
        rec.apply_snapshot(&mut store, vec![record("d1", Some(40))]);

        // The buffered push arrived after the poll was issued and wins.
        assert_eq!(store.device(&DeviceId::new("d1")).unwrap().battery_level, Some(55));
        assert_eq!(rec.connection_state(), ChannelState::Degraded);
    }

    #[test]
    fn failed_gap_fill_still_replays_buffer() {
        let mut store = EntityStore::new(16);
        let mut rec = Reconciler::new();
        rec.connection_established();
        rec.ingest(&mut store, PushEvent::DeviceConnected { device: record("d1", Some(70)) })
            .unwrap();

        rec.poll_failed(&mut store);
        assert_eq!(rec.connection_state(), ChannelState::Healthy);
        assert_eq!(store.device(&DeviceId::new("d1")).unwrap().battery_level, Some(70));
    }
}
