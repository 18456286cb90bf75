//! Notification throttler
//!
//! Converts store change events into a bounded, deduplicated, auto-expiring
//! operator alert queue. Purely presentation-adjacent: nothing in here feeds
//! back into the entity store, and a full or lagging queue never affects
//! merge correctness.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use super::model::{CommandStatus, DeviceStatus};
use super::store::ChangeEvent;

/// Operator-facing severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Something finished successfully
    Success,
    /// Something degraded
    Warning,
    /// Something failed
    Error,
}

/// A visible operator alert
#[derive(Debug, Clone)]
pub struct Alert {
    /// Unique alert id
    pub id: Uuid,
    /// Severity class
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
    /// Entity the alert concerns (coalescing key)
    pub entity: String,
    /// When the alert was raised
    pub created_at: DateTime<Utc>,
    /// When the alert auto-expires
    pub expires_at: DateTime<Utc>,
}

/// Bounded, coalescing alert queue fed by the store's change feed
pub struct Notifier {
    queue: VecDeque<Alert>,
    capacity: usize,
    coalesce_window: Duration,
    lifetime: Duration,
    /// Per-entity timestamp of the last emitted alert
    last_emitted: HashMap<String, DateTime<Utc>>,
}

impl Notifier {
    /// Create a notifier
    ///
    /// `capacity` bounds the visible queue (oldest evicted first),
    /// `coalesce_window` is the per-entity burst window, `lifetime` the
    /// visible duration of each alert.
    pub fn new(capacity: usize, coalesce_window: Duration, lifetime: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            coalesce_window,
            lifetime,
            last_emitted: HashMap::new(),
        }
    }

    /// Map a change event to an alert, subject to coalescing
    ///
    /// Multiple change events for the same entity within the coalescing
    /// window produce at most one visible alert: a higher-severity change
    /// upgrades the existing alert in place, anything else is suppressed.
    /// Returns the newly raised alert, if one was.
    pub fn observe(&mut self, event: &ChangeEvent, now: DateTime<Utc>) -> Option<&Alert> {
        let (entity, severity, message) = describe(event)?;

        if let Some(last) = self.last_emitted.get(&entity) {
            if now - *last < self.coalesce_window {
                if let Some(existing) = self.queue.iter_mut().rev().find(|a| a.entity == entity)
                {
                    if rank(severity) > rank(existing.severity) {
                        existing.severity = severity;
                        existing.message = message;
                        existing.expires_at = now + self.lifetime;
                    }
                }
                return None;
            }
        }
        self.last_emitted.insert(entity.clone(), now);

        self.queue.push_back(Alert {
            id: Uuid::new_v4(),
            severity,
            message,
            entity,
            created_at: now,
            expires_at: now + self.lifetime,
        });
        while self.queue.len() > self.capacity {
            self.queue.pop_front();
        }
        self.queue.back()
    }

    /// Drop expired alerts and stale coalescing entries
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        self.queue.retain(|alert| alert.expires_at > now);
        let window = self.coalesce_window;
        self.last_emitted.retain(|_, at| now - *at < window);
    }

    /// Currently visible alerts, oldest first
    pub fn active(&self, now: DateTime<Utc>) -> Vec<&Alert> {
        self.queue.iter().filter(|a| a.expires_at > now).collect()
    }
}

fn rank(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 0,
        Severity::Success => 1,
        Severity::Warning => 2,
        Severity::Error => 3,
    }
}

fn describe(event: &ChangeEvent) -> Option<(String, Severity, String)> {
    match event {
        ChangeEvent::DeviceCreated(device) => Some((
            format!("device:{}", device.device_id),
            Severity::Info,
            format!("Device {} connected", device.device_id),
        )),
        ChangeEvent::DeviceUpdated {
            device,
            status_changed,
        } => {
            let (severity, verb) = match (status_changed, device.status) {
                (true, DeviceStatus::Offline) => (Severity::Warning, "disconnected"),
                (true, DeviceStatus::Online) => (Severity::Info, "connected"),
                (false, _) => (Severity::Info, "updated"),
            };
            Some((
                format!("device:{}", device.device_id),
                severity,
                format!("Device {} {verb}", device.device_id),
            ))
        }
        ChangeEvent::DeviceRemoved(id) => Some((
            format!("device:{id}"),
            Severity::Info,
            format!("Device {id} removed"),
        )),
        ChangeEvent::CommandCreated(command) => Some((
            format!("command:{}", command.command_id),
            Severity::Info,
            format!(
                "Command {} ({}) created",
                command.command_id, command.command_type
            ),
        )),
        ChangeEvent::CommandUpdated(command) => {
            let severity = match command.status {
                CommandStatus::Completed => Severity::Success,
                CommandStatus::Failed => Severity::Error,
                _ => Severity::Info,
            };
            Some((
                format!("command:{}", command.command_id),
                severity,
                format!("Command {} {}", command.command_id, command.status),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{Device, DeviceId, Seq};

    fn device(id: &str, status: DeviceStatus) -> Device {
        Device {
            device_id: DeviceId::new(id),
            model: None,
            manufacturer: None,
            android_version: None,
            api_level: None,
            status,
            battery_level: None,
            is_charging: false,
            ip_address: None,
            latitude: None,
            longitude: None,
            last_seen: Utc::now(),
            seq: Seq(1),
        }
    }

    fn notifier() -> Notifier {
        Notifier::new(3, Duration::seconds(3), Duration::seconds(5))
    }

    #[test]
    fn disconnect_maps_to_warning() {
        let mut n = notifier();
        let event = ChangeEvent::DeviceUpdated {
            device: device("d1", DeviceStatus::Offline),
            status_changed: true,
        };
        let alert = n.observe(&event, Utc::now()).unwrap();
        assert_eq!(alert.severity, Severity::Warning);
    }

    #[test]
    fn burst_for_one_entity_coalesces() {
        let mut n = notifier();
        let now = Utc::now();
        let event = ChangeEvent::DeviceUpdated {
            device: device("d1", DeviceStatus::Online),
            status_changed: false,
        };

        assert!(n.observe(&event, now).is_some());
        assert!(n.observe(&event, now + Duration::seconds(1)).is_none());
        assert!(n.observe(&event, now + Duration::seconds(2)).is_none());
        // Outside the window a new alert is visible again.
        assert!(n.observe(&event, now + Duration::seconds(4)).is_some());
    }

    #[test]
    fn higher_severity_upgrades_within_window() {
        let mut n = notifier();
        let now = Utc::now();
        let created = ChangeEvent::DeviceCreated(device("d1", DeviceStatus::Online));
        n.observe(&created, now).unwrap();

        let failed = ChangeEvent::DeviceUpdated {
            device: device("d1", DeviceStatus::Offline),
            status_changed: true,
        };
        assert!(n.observe(&failed, now + Duration::seconds(1)).is_none());

        let active = n.active(now + Duration::seconds(2));
        assert_eq!(active.len(), 1, "still at most one alert for the window");
        assert_eq!(active[0].severity, Severity::Warning);
    }

    #[test]
    fn queue_is_bounded_oldest_evicted() {
        let mut n = notifier();
        let now = Utc::now();
        for i in 0..5 {
            let event = ChangeEvent::DeviceCreated(device(&format!("d{i}"), DeviceStatus::Online));
            n.observe(&event, now);
        }
        let active = n.active(now);
        assert_eq!(active.len(), 3);
        assert!(active[0].entity.ends_with("d2"), "oldest alerts evicted first");
    }

    #[test]
    fn alerts_auto_expire() {
        let mut n = notifier();
        let now = Utc::now();
        let event = ChangeEvent::DeviceCreated(device("d1", DeviceStatus::Online));
        n.observe(&event, now);

        assert_eq!(n.active(now + Duration::seconds(4)).len(), 1);
        assert_eq!(n.active(now + Duration::seconds(6)).len(), 0);

        n.sweep(now + Duration::seconds(6));
        assert!(n.queue.is_empty());
    }
}
