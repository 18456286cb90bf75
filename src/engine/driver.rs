//! Async driver
//!
//! Glue between the synchronous engine core and the embedding application's
//! transport adapter. Owns the fallback timer, runs poll requests as spawned
//! tasks under the configured deadline, and serializes all engine access
//! through one lock so push, poll, and user-action callbacks interleave
//! without corrupting state.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};

use super::Engine;
use super::error::{TransportError, TransportResult, UserActionError};
use super::model::{CommandId, DeviceId, Priority};
use super::refresh::TickOutcome;
use super::store::FleetStats;
use super::transport::{DeviceRecord, PushEvent, Transport};

/// Signal from the push channel adapter
#[derive(Debug)]
pub enum PushSignal {
    /// Push channel (re)connected
    Connected,
    /// Push channel dropped
    Disconnected,
    /// A decoded push event
    Event(PushEvent),
    /// An undecoded push payload; malformed payloads are discarded whole
    Raw(serde_json::Value),
}

/// Runs the engine against a transport adapter
pub struct Driver<T: Transport> {
    engine: Arc<RwLock<Engine>>,
    transport: Arc<T>,
}

impl<T: Transport> Driver<T> {
    /// Create a driver around an engine and a transport implementation
    pub fn new(engine: Engine, transport: T) -> Self {
        Self {
            engine: Arc::new(RwLock::new(engine)),
            transport: Arc::new(transport),
        }
    }

    /// Shared handle to the engine, for query-side consumers
    pub fn engine(&self) -> Arc<RwLock<Engine>> {
        Arc::clone(&self.engine)
    }

    /// Drive the engine until the push signal channel closes
    pub async fn run(self, mut signals: mpsc::Receiver<PushSignal>) -> anyhow::Result<()> {
        let (refresh_interval, poll_deadline) = {
            let engine = self.engine.read();
            (engine.config().refresh_interval, engine.config().poll_timeout)
        };

        let (poll_tx, mut poll_rx) = mpsc::channel::<TransportResult<Vec<DeviceRecord>>>(4);
        let mut ticker = interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    self.handle_signal(signal, &poll_tx);
                }
                _ = ticker.tick() => {
                    let outcome = {
                        let mut engine = self.engine.write();
                        engine.sweep_alerts(Utc::now());
                        engine.scheduler_tick()
                    };
                    if outcome == TickOutcome::Poll {
                        self.spawn_poll(&poll_tx, poll_deadline);
                    }
                }
                Some(result) = poll_rx.recv() => {
                    let mut engine = self.engine.write();
                    match result {
                        Ok(devices) => {
                            engine.handle_poll_result(devices);
                        }
                        Err(error) => engine.handle_poll_error(error),
                    }
                }
            }
        }

        tracing::info!("push signal channel closed, driver stopping");
        Ok(())
    }

    fn handle_signal(
        &self,
        signal: PushSignal,
        poll_tx: &mpsc::Sender<TransportResult<Vec<DeviceRecord>>>,
    ) {
        match signal {
            PushSignal::Connected => {
                let gap_fill = self.engine.write().connection_established();
                if gap_fill {
                    let deadline = self.engine.read().config().poll_timeout;
                    self.spawn_poll(poll_tx, deadline);
                }
            }
            PushSignal::Disconnected => self.engine.write().connection_lost(),
            PushSignal::Event(event) => {
                // Rejections are logged inside the engine and leave it
                // queryable; nothing to do here.
                let _ = self.engine.write().handle_push_event(event);
            }
            PushSignal::Raw(value) => match PushEvent::decode(value) {
                Ok(event) => {
                    let _ = self.engine.write().handle_push_event(event);
                }
                Err(error) => tracing::warn!(error = %error, "push payload discarded"),
            },
        }
    }

    fn spawn_poll(
        &self,
        poll_tx: &mpsc::Sender<TransportResult<Vec<DeviceRecord>>>,
        deadline: std::time::Duration,
    ) {
        let transport = Arc::clone(&self.transport);
        let tx = poll_tx.clone();
        tokio::spawn(async move {
            let result = match timeout(deadline, transport.fetch_devices()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(deadline.as_millis() as u64)),
            };
            let _ = tx.send(result).await;
        });
    }

    /// Submit a command to the selected device
    ///
    /// Creates the tentative entry, POSTs the request, and reconciles the
    /// entry with the server-assigned id, or cancels it when the server
    /// rejects the submission. Returns the confirmed command id.
    pub async fn submit_command(
        &self,
        command_type: &str,
        data: serde_json::Value,
        priority: Priority,
    ) -> Result<CommandId, SubmitError> {
        let (tentative, request) = self
            .engine
            .write()
            .submit_command(command_type, data, priority)?;

        match self.transport.submit_command(request).await {
            Ok(receipt) => {
                let reconciled = self
                    .engine
                    .write()
                    .confirm_submission(&tentative, receipt.command_id.clone());
                if !reconciled {
                    tracing::warn!(
                        command = %receipt.command_id,
                        "no tentative entry left to reconcile"
                    );
                }
                Ok(receipt.command_id)
            }
            Err(error) => {
                self.engine.write().submission_failed(&tentative);
                Err(error.into())
            }
        }
    }

    /// Delete a device server-side, then drop it from the mirror
    ///
    /// The local entry is only removed once the server acknowledges.
    pub async fn delete_device(&self, id: &DeviceId) -> TransportResult<()> {
        self.transport.delete_device(id).await?;
        self.engine.write().delete_device_confirmed(id);
        Ok(())
    }

    /// Fetch server-side aggregate counts
    pub async fn fetch_stats(&self) -> TransportResult<FleetStats> {
        self.transport.fetch_stats().await
    }
}

/// Failure of an end-to-end command submission
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Rejected locally before anything was sent
    #[error(transparent)]
    UserAction(#[from] UserActionError),

    /// The server rejected or never received the submission
    #[error(transparent)]
    Transport(#[from] TransportError),
}
