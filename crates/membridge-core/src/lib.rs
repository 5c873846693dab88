//! membridge core library
//!
//! Live synchronization between a multiworld session and the memory of an
//! emulated game.
//!
//! ## Overview
//!
//! A running game knows nothing about the multiworld: it only has bytes in
//! RAM and SRAM. The bridge keeps both sides consistent, tick by tick:
//!
//! - items granted by the session are injected into the game one at a time
//!   through a single delivery slot, exactly once, even across reconnects
//! - locations the game marks as checked are reported to the session
//! - progress counters advanced by both the bridge and gameplay never
//!   regress or double count
//! - deaths are relayed in both directions when death link is enabled
//!
//! Memory layout comes from a versioned JSON [`GameProfile`]; emulator
//! access goes through the [`MemoryPort`] trait; the session is reached
//! through a [`SessionLink`] channel pair.
//!
//! ## Quick Start
//!
//! ```ignore
//! use membridge_core::{BridgeConfig, GameProfile, InMemoryPort, ProcessHandle,
//!                      ReconciliationLoop, SessionLink};
//!
//! let profile = GameProfile::load("profiles/demo.json")?.resolve()?;
//! let process = ProcessHandle::new().map(0x7E_0000, 0x2000);
//! let (link, remote) = SessionLink::pair(256);
//!
//! let mut bridge = ReconciliationLoop::new(
//!     profile,
//!     BridgeConfig::default(),
//!     InMemoryPort::new(process),
//!     link,
//! );
//! let mut events = bridge.subscribe();
//! tokio::spawn(async move { bridge.run().await });
//! // feed `remote.events`, read `remote.outbound`
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod deathlink;
pub mod delivery;
pub mod error;
pub mod events;
pub mod logging;
pub mod port;
pub mod profile;
pub mod progress;
pub mod remote;
pub mod runner;
pub mod scanner;
pub mod session;
pub mod snapshot;

// Re-exports
pub use bridge::{Bridge, SessionInfo, TickPhase, TickReport};
pub use codec::{BitLocation, BitOrder, Endianness};
pub use config::BridgeConfig;
pub use deathlink::DeathLinkBridge;
pub use delivery::{DeliveryEvent, DeliveryItem, DeliveryQueue, SlotState};
pub use error::{BridgeError, BridgeResult, ProfileError, TransportError};
pub use events::{BridgeEvent, BridgeStatus};
pub use port::{InMemoryPort, MemoryPort, ProcessHandle, WriteRecord};
pub use profile::{GameProfile, ItemCategory, ItemId, LocationId, ResolvedProfile};
pub use progress::{ProgressCounter, ProgressReconciler, Reconciliation};
pub use remote::{
    ClientMessage, NetworkItem, ReceivedItems, RemoteEndpoint, ServerMessage, SessionEvent,
    SessionLink,
};
pub use runner::ReconciliationLoop;
pub use scanner::{CheckedLocationSet, LocationScanner};
pub use session::SessionValidator;
pub use snapshot::{MemorySnapshot, TargetMemory};
