//! Bridge status and event notifications
//!
//! The reconciliation loop publishes both on a broadcast channel so a CLI,
//! a tracker UI or a test can follow what the bridge is doing without
//! touching its state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  BridgeStatus: where the loop currently is                  │
//! │  ├── Detached: no target process                            │
//! │  ├── WaitingForSession: remote session not connected        │
//! │  ├── Verifying: session id in memory not confirmed yet      │
//! │  ├── Synchronizing: every tick reconciles state             │
//! │  ├── Reconnecting: backing off after a transport failure    │
//! │  ├── Stopped: loop ended                                    │
//! │  └── Error: fatal error, loop ended                         │
//! │                                                             │
//! │  BridgeEvent: things that happened during a tick            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::Serialize;

use crate::delivery::DeliveryEvent;
use crate::profile::LocationId;

/// Status of the reconciliation loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeStatus {
    /// No target process attached
    #[default]
    Detached,
    /// Attached, waiting for the remote session to connect
    WaitingForSession,
    /// Waiting for the target to carry the session id
    Verifying,
    /// Reconciling every tick
    Synchronizing {
        /// Items received from the session
        received: usize,
        /// Locations reported so far
        checked: usize,
    },
    /// Waiting before the next attach attempt
    Reconnecting {
        /// Consecutive failed attempts
        attempt: u32,
    },
    /// The loop was shut down
    Stopped,
    /// The loop ended with a fatal error
    Error {
        /// Error message
        message: String,
    },
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeStatus::Detached => write!(f, "Detached"),
            BridgeStatus::WaitingForSession => write!(f, "Waiting for session"),
            BridgeStatus::Verifying => write!(f, "Verifying session"),
            BridgeStatus::Synchronizing { received, checked } => write!(
                f,
                "Synchronizing ({} received, {} checked)",
                received, checked
            ),
            BridgeStatus::Reconnecting { attempt } => {
                write!(f, "Reconnecting (attempt {})", attempt)
            }
            BridgeStatus::Stopped => write!(f, "Stopped"),
            BridgeStatus::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

/// Events emitted by the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Loop status changed
    StatusChanged {
        /// New status
        status: BridgeStatus,
    },
    /// Session id in memory confirmed
    SessionVerified {
        /// Seed name of the session
        seed: String,
    },
    /// Progress of the delivery slot
    Delivery(DeliveryEvent),
    /// Locations sent to the session
    LocationsChecked {
        /// Newly checked ids, ascending
        locations: Vec<LocationId>,
    },
    /// A counter regressed in memory and was restored
    CounterRepaired {
        /// Counter name
        counter: String,
        /// Restored value
        value: u64,
        /// Value found in memory
        memory: u64,
    },
    /// A death from another player was written to the target
    DeathReceived {
        /// Player who died
        source: String,
    },
    /// A local death was relayed to the session
    DeathSent,
    /// The game reported its goal as completed
    GoalReached,
    /// A tick failed without ending the loop
    TickFailed {
        /// Error message
        message: String,
    },
}

impl BridgeEvent {
    /// Whether this event is a status change
    pub fn is_status(&self) -> bool {
        matches!(self, BridgeEvent::StatusChanged { .. })
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeEvent::StatusChanged { status } => write!(f, "status: {}", status),
            BridgeEvent::SessionVerified { seed } => write!(f, "session verified: {}", seed),
            BridgeEvent::Delivery(DeliveryEvent::Injected { index, item }) => {
                write!(f, "item #{} ({}) injected", index, item)
            }
            BridgeEvent::Delivery(DeliveryEvent::Consumed { index, item }) => {
                write!(f, "item #{} ({}) consumed", index, item)
            }
            BridgeEvent::Delivery(DeliveryEvent::CounterApplied {
                index,
                item,
                counter,
            }) => write!(f, "item #{} ({}) added to {}", index, item, counter),
            BridgeEvent::Delivery(DeliveryEvent::Skipped { index, item }) => {
                write!(f, "item #{} ({}) skipped", index, item)
            }
            BridgeEvent::Delivery(DeliveryEvent::Recovered { index }) => {
                write!(f, "item #{} recovered after reconnect", index)
            }
            BridgeEvent::LocationsChecked { locations } => {
                write!(f, "locations checked: {:?}", locations)
            }
            BridgeEvent::CounterRepaired {
                counter,
                value,
                memory,
            } => write!(f, "counter {} restored to {} (memory had {})", counter, value, memory),
            BridgeEvent::DeathReceived { source } => write!(f, "death received from {}", source),
            BridgeEvent::DeathSent => write!(f, "death sent"),
            BridgeEvent::GoalReached => write!(f, "goal reached"),
            BridgeEvent::TickFailed { message } => write!(f, "tick failed: {}", message),
        }
    }
}
