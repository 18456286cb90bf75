//! Fleetmirror: client-side state synchronization for fleet dashboards
//!
//! This crate implements the reconciliation core of a fleet operator
//! dashboard:
//! - Canonical in-memory mirror of device and command entities
//! - Sequence-gated, commutative and idempotent merge of a continuous push
//!   stream against periodic full-state polls
//! - A centrally enforced command lifecycle state machine with sticky
//!   terminal states
//! - Gap-fill reconciliation on push-channel recovery, with event buffering
//! - Fallback polling while degraded, with a single-in-flight discipline
//! - A bounded, coalescing, auto-expiring operator alert queue
//!
//! Transport, rendering, and authentication are external collaborators; the
//! engine consumes typed push events and poll snapshots through the
//! [`engine::Transport`] seam.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core modules implementing the synchronization and merge model
pub mod engine;

// Re-export key types for convenience
pub use engine::{Engine, EngineConfig};

/// Current version of the fleetmirror crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
