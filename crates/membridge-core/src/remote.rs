//! Remote session messages and the channel link to the connection task
//!
//! The bridge never talks to the network itself. A connection task (outside
//! this crate, or the simulated server in tests and the CLI) owns the socket
//! and exchanges typed messages with the bridge over a [`SessionLink`]:
//!
//! ```text
//! ┌──────────────┐  SessionEvent (Connected, ReceivedItems, ...)  ┌──────────┐
//! │  connection  │ ──────────────────────────────────────────────►│  bridge  │
//! │     task     │ ◄──────────────────────────────────────────────│   loop   │
//! └──────────────┘  ClientMessage (LocationChecks, Bounce, Set)   └──────────┘
//! ```
//!
//! Messages are a closed set of serde types tagged by `cmd`; JSON is used on
//! the boundary via [`ClientMessage::encode`] / [`ServerMessage::decode`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{BridgeError, BridgeResult};
use crate::profile::{ItemId, LocationId};

/// Tag marking death-link bounces
pub const DEATH_LINK_TAG: &str = "DeathLink";

/// Default capacity of the link channels
pub const LINK_CHANNEL_CAPACITY: usize = 256;

/// Payload of a death-link bounce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathLinkData {
    /// Unix timestamp (seconds, fractional)
    pub time: f64,
    /// Human readable cause
    #[serde(default)]
    pub cause: String,
    /// Name of the player who died
    pub source: String,
}

impl DeathLinkData {
    /// A death that happens now.
    pub fn now(cause: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            cause: cause.into(),
            source: source.into(),
        }
    }
}

/// Key/value storage operation applied server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "value", rename_all = "snake_case")]
pub enum DataStorageOperation {
    /// Set to the `default` of the request if the key does not exist
    Default,
    /// Merge a map into the stored map
    Update(Value),
    /// Overwrite the stored value
    Replace(Value),
}

/// Client status reported to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Connected and playing
    Playing,
    /// Goal reached
    Goal,
}

/// Messages sent by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientMessage {
    /// Newly checked locations
    LocationChecks {
        /// Location ids, ascending and unique
        locations: Vec<LocationId>,
    },
    /// Broadcast to other clients (used for death link)
    Bounce {
        /// Tags selecting the receivers
        tags: Vec<String>,
        /// Death-link payload
        data: DeathLinkData,
    },
    /// Write to server-side key/value storage
    Set {
        /// Storage key
        key: String,
        /// Value used when the key does not exist yet
        default: Value,
        /// Ask the server to echo the resulting value
        want_reply: bool,
        /// Operations applied in order
        operations: Vec<DataStorageOperation>,
    },
    /// Report client status
    StatusUpdate {
        /// New status
        status: ClientStatus,
    },
    /// Ask the server to resend the full received-items list
    Sync,
}

impl ClientMessage {
    /// Build a `LocationChecks` message from a batch.
    pub fn location_checks(batch: &BTreeSet<LocationId>) -> Self {
        ClientMessage::LocationChecks {
            locations: batch.iter().copied().collect(),
        }
    }

    /// Build a death-link bounce.
    pub fn death_link(cause: impl Into<String>, source: impl Into<String>) -> Self {
        ClientMessage::Bounce {
            tags: vec![DEATH_LINK_TAG.to_string()],
            data: DeathLinkData::now(cause, source),
        }
    }

    /// Build a `Set` that overwrites `key` with `value`.
    pub fn replace(key: impl Into<String>, value: Value) -> Self {
        ClientMessage::Set {
            key: key.into(),
            default: Value::from(0),
            want_reply: false,
            operations: vec![DataStorageOperation::Replace(value)],
        }
    }

    /// Encode as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from JSON.
    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One item granted by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkItem {
    /// Item id
    pub item: ItemId,
    /// Location the item was found at
    #[serde(default)]
    pub location: i64,
    /// Slot of the finding player
    #[serde(default)]
    pub player: u32,
}

/// Messages received from the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ServerMessage {
    /// Slot login accepted
    Connected {
        /// Our slot number
        slot: u32,
        /// Our slot (player) name
        slot_name: String,
        /// Seed name; the session id the target process must carry
        seed_name: String,
        /// Locations the session already knows as checked
        #[serde(default)]
        checked_locations: Vec<LocationId>,
    },
    /// Items granted to us, starting at `index`
    ReceivedItems {
        /// Index of the first item in `items`
        index: usize,
        /// Granted items in order
        items: Vec<NetworkItem>,
    },
    /// A bounce from another client
    Bounced {
        /// Tags of the bounce
        #[serde(default)]
        tags: Vec<String>,
        /// Arbitrary payload
        #[serde(default)]
        data: Value,
    },
}

impl ServerMessage {
    /// Death-link payload of a `Bounced` message, if it is one.
    pub fn death_link(&self) -> Option<DeathLinkData> {
        match self {
            ServerMessage::Bounced { tags, data } if tags.iter().any(|t| t == DEATH_LINK_TAG) => {
                serde_json::from_value(data.clone()).ok()
            }
            _ => None,
        }
    }

    /// Encode as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from JSON.
    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Events delivered from the connection task to the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A message from the server
    Message(ServerMessage),
    /// The connection to the server dropped; a new `Connected` follows on
    /// reconnect
    Disconnected,
}

/// Result of applying a `ReceivedItems` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Index 0: the whole sequence was replaced
    Replaced,
    /// Items were appended at the end
    Appended(usize),
    /// The message repeats items already known
    Duplicate,
    /// The message starts past the known end; a resync is needed
    OutOfSync {
        /// Index the next message should start at
        expected: usize,
        /// Index the message actually started at
        got: usize,
    },
}

/// Ordered sequence of items granted by the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedItems {
    items: Vec<ItemId>,
}

impl ReceivedItems {
    /// Empty sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are known
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item at `index`
    pub fn get(&self, index: usize) -> Option<ItemId> {
        self.items.get(index).copied()
    }

    /// Forget everything (session disconnected)
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Apply a `ReceivedItems` message.
    pub fn apply(&mut self, index: usize, items: &[NetworkItem]) -> ApplyOutcome {
        let ids = items.iter().map(|i| i.item);
        if index == 0 {
            self.items = ids.collect();
            return ApplyOutcome::Replaced;
        }
        if index == self.items.len() {
            self.items.extend(ids);
            return ApplyOutcome::Appended(items.len());
        }
        if index < self.items.len() {
            // overlapping resend: keep what we have, append the tail
            let known = self.items.len() - index;
            let tail: Vec<ItemId> = items.iter().skip(known).map(|i| i.item).collect();
            if tail.is_empty() {
                return ApplyOutcome::Duplicate;
            }
            let added = tail.len();
            self.items.extend(tail);
            return ApplyOutcome::Appended(added);
        }
        ApplyOutcome::OutOfSync {
            expected: self.items.len(),
            got: index,
        }
    }
}

/// Bridge side of the channel pair
#[derive(Debug)]
pub struct SessionLink {
    events: mpsc::Receiver<SessionEvent>,
    outbound: mpsc::Sender<ClientMessage>,
}

/// Connection-task side of the channel pair
#[derive(Debug)]
pub struct RemoteEndpoint {
    /// Feed events to the bridge
    pub events: mpsc::Sender<SessionEvent>,
    /// Messages the bridge wants sent
    pub outbound: mpsc::Receiver<ClientMessage>,
}

impl SessionLink {
    /// Create a connected link/endpoint pair.
    pub fn pair(capacity: usize) -> (SessionLink, RemoteEndpoint) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            SessionLink {
                events: events_rx,
                outbound: outbound_tx,
            },
            RemoteEndpoint {
                events: events_tx,
                outbound: outbound_rx,
            },
        )
    }

    /// Take every event that is ready without waiting.
    pub fn drain(&mut self) -> BridgeResult<Vec<SessionEvent>> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => return Ok(events),
                Err(TryRecvError::Disconnected) if !events.is_empty() => return Ok(events),
                Err(TryRecvError::Disconnected) => return Err(BridgeError::SessionClosed),
            }
        }
    }

    /// Queue a message for the connection task.
    pub async fn send(&self, message: ClientMessage) -> BridgeResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| BridgeError::SessionClosed)
    }
}
