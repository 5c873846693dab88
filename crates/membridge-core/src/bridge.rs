//! One reconciliation tick
//!
//! [`Bridge`] owns every piece of per-session state and advances it by one
//! tick at a time:
//!
//! ```text
//! session events ─► session gate ─► snapshot ─► delivery ─► progress
//!                                                              │
//!            send batch ◄── goal ◄── death link ◄── scan ◄─────┘
//! ```
//!
//! Nothing past the gate runs until the target carries the session's seed.
//! A transport failure aborts the tick and drops everything derived from
//! the target's memory; it is rebuilt from memory after re-attaching.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::deathlink::DeathLinkBridge;
use crate::delivery::{DeliveryQueue, SlotState};
use crate::error::BridgeResult;
use crate::events::{BridgeEvent, BridgeStatus};
use crate::port::MemoryPort;
use crate::profile::{LocationId, ResolvedProfile};
use crate::progress::{ProgressReconciler, Reconciliation};
use crate::remote::{
    ApplyOutcome, ClientMessage, ClientStatus, ReceivedItems, ServerMessage, SessionEvent,
    SessionLink,
};
use crate::scanner::LocationScanner;
use crate::session::SessionValidator;
use crate::snapshot::{MemorySnapshot, TargetMemory};

/// Slot information from the session's `Connected` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Our slot number
    pub slot: u32,
    /// Our player name
    pub slot_name: String,
    /// Seed name; must match the id stored in the target
    pub seed_name: String,
    /// Ids the session knows as checked: announced on connect or reported
    /// since
    pub checked_locations: BTreeSet<LocationId>,
}

/// How far a tick got
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TickPhase {
    /// No remote session yet
    #[default]
    WaitingForSession,
    /// Target does not carry the session id (yet)
    Verifying,
    /// Full reconciliation ran
    Synchronized,
}

/// Result of a successful tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// How far the tick got
    pub phase: TickPhase,
    /// Everything that happened, in order
    pub events: Vec<BridgeEvent>,
    /// Messages handed to the session link
    pub sent: usize,
}

/// Session-scoped bridge state
#[derive(Debug)]
pub struct Bridge {
    profile: ResolvedProfile,
    validator: SessionValidator,
    queue: DeliveryQueue,
    progress: ProgressReconciler,
    scanner: LocationScanner,
    death_link: Option<DeathLinkBridge>,
    session: Option<SessionInfo>,
    received: ReceivedItems,
    snapshot: MemorySnapshot,
    goal_reported: bool,
    resync_requested: bool,
}

impl Bridge {
    /// Create a bridge for a resolved profile.
    pub fn new(profile: ResolvedProfile, config: &BridgeConfig) -> Self {
        for error in &profile.skipped {
            warn!(game = %profile.game, error = %error, "Ignoring profile entry");
        }
        let death_link = match (&profile.death_link, config.death_link) {
            (Some(slot), true) => Some(DeathLinkBridge::new(
                slot.clone(),
                config.death_link_cooldown(),
            )),
            (None, true) => {
                warn!("Death link enabled but the profile has no death link layout");
                None
            }
            _ => None,
        };

        Self {
            validator: SessionValidator::new(
                profile.session,
                config.session_id_width,
                config.session_mismatch_confirmations,
            ),
            queue: DeliveryQueue::new(profile.delivery.clone(), profile.items.clone()),
            progress: ProgressReconciler::new(&profile.counters),
            scanner: LocationScanner::new(
                profile.locations.clone(),
                profile.groups.clone(),
                profile.pending_checks,
            ),
            death_link,
            session: None,
            received: ReceivedItems::new(),
            snapshot: MemorySnapshot::default(),
            goal_reported: false,
            resync_requested: false,
            profile,
        }
    }

    /// Current remote session, if connected
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Items received in this session
    pub fn received(&self) -> &ReceivedItems {
        &self.received
    }

    /// Location scanner
    pub fn scanner(&self) -> &LocationScanner {
        &self.scanner
    }

    /// Progress counters
    pub fn progress(&self) -> &ProgressReconciler {
        &self.progress
    }

    /// Delivery slot state
    pub fn slot_state(&self) -> &SlotState {
        self.queue.state()
    }

    /// Whether the session gate has passed since the last reset
    pub fn is_verified(&self) -> bool {
        self.validator.is_verified()
    }

    /// Status matching the last tick's phase
    pub fn status(&self, phase: TickPhase) -> BridgeStatus {
        match phase {
            TickPhase::WaitingForSession => BridgeStatus::WaitingForSession,
            TickPhase::Verifying => BridgeStatus::Verifying,
            TickPhase::Synchronized => BridgeStatus::Synchronizing {
                received: self.received.len(),
                checked: self.scanner.checked().len(),
            },
        }
    }

    /// Drop all state derived from the target's memory.
    ///
    /// Called after a transport failure; everything is re-read once the
    /// port is attached again. Checked locations restart from what the
    /// session knows, the rest comes from the next scan.
    pub fn reset_target(&mut self) {
        debug!("Resetting target state");
        self.validator.reset();
        self.queue.reset();
        self.progress.reset();
        match &self.session {
            Some(session) => self.scanner.seed(session.checked_locations.iter().copied()),
            None => self.scanner.reset(),
        }
        self.snapshot = MemorySnapshot::default();
    }

    fn reset_session(&mut self) {
        self.reset_target();
        self.progress.forget_published();
        self.received.clear();
        if let Some(death_link) = &mut self.death_link {
            death_link.reset();
        }
        self.goal_reported = false;
        self.resync_requested = false;
    }

    /// Run one tick.
    ///
    /// Transport errors reset the target state before they are returned.
    pub async fn tick<P: MemoryPort>(
        &mut self,
        port: &mut P,
        link: &mut SessionLink,
    ) -> BridgeResult<TickReport> {
        let result = self.run_tick(port, link).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.reset_target();
            }
        }
        result
    }

    async fn run_tick<P: MemoryPort>(
        &mut self,
        port: &mut P,
        link: &mut SessionLink,
    ) -> BridgeResult<TickReport> {
        let mut report = TickReport::default();

        for event in link.drain()? {
            if let Some(reply) = self.handle_session_event(event) {
                link.send(reply).await?;
                report.sent += 1;
            }
        }

        let Some(seed) = self.session.as_ref().map(|s| s.seed_name.clone()) else {
            return Ok(report);
        };

        let was_verified = self.validator.is_verified();
        if !self.validator.check(port, seed.as_bytes()).await? {
            report.phase = TickPhase::Verifying;
            return Ok(report);
        }
        if !was_verified {
            report.events.push(BridgeEvent::SessionVerified { seed });
        }
        report.phase = TickPhase::Synchronized;

        self.snapshot = MemorySnapshot::capture(port, &self.profile.regions).await?;
        let mut mem = TargetMemory::new(port, &mut self.snapshot);

        for event in self
            .queue
            .step(&mut mem, &self.received, &mut self.progress)
            .await?
        {
            report.events.push(BridgeEvent::Delivery(event));
        }

        for (counter, outcome) in self.progress.step(&mut mem).await? {
            if let Reconciliation::Repaired { value, memory } = outcome {
                report.events.push(BridgeEvent::CounterRepaired {
                    counter,
                    value,
                    memory,
                });
            }
        }

        // report before touching memory again so a failing write cannot
        // swallow a batch the scanner already recorded
        let batch = self.scanner.scan(mem.snapshot());
        if !batch.is_empty() {
            link.send(ClientMessage::location_checks(&batch)).await?;
            if let Some(session) = &mut self.session {
                session.checked_locations.extend(batch.iter().copied());
            }
            report.sent += 1;
            report.events.push(BridgeEvent::LocationsChecked {
                locations: batch.into_iter().collect(),
            });
        }
        self.scanner.clear_pending(&mut mem).await?;

        if let Some(death_link) = &mut self.death_link {
            let step = death_link.step(&mut mem).await?;
            if let Some(death) = step.delivered {
                report.events.push(BridgeEvent::DeathReceived {
                    source: death.source,
                });
            }
            if let Some(bounce) = step.outgoing {
                link.send(bounce).await?;
                report.sent += 1;
                report.events.push(BridgeEvent::DeathSent);
            }
        }

        if let Some(goal) = &self.profile.goal {
            if !self.goal_reported && mem.bit(goal)? {
                info!("Goal completed");
                link.send(ClientMessage::StatusUpdate {
                    status: ClientStatus::Goal,
                })
                .await?;
                self.goal_reported = true;
                report.sent += 1;
                report.events.push(BridgeEvent::GoalReached);
            }
        }

        let slot = self.session.as_ref().map(|s| s.slot).unwrap_or_default();
        for (counter, value) in self.progress.take_changes() {
            link.send(ClientMessage::replace(
                storage_key(slot, &counter),
                Value::from(value),
            ))
            .await?;
            report.sent += 1;
        }

        Ok(report)
    }

    /// Apply one session event; returns a message to send back, if any.
    fn handle_session_event(&mut self, event: SessionEvent) -> Option<ClientMessage> {
        match event {
            SessionEvent::Disconnected => {
                if self.session.take().is_some() {
                    info!("Remote session disconnected");
                }
                self.reset_session();
                None
            }
            SessionEvent::Message(ServerMessage::Connected {
                slot,
                slot_name,
                seed_name,
                checked_locations,
            }) => {
                info!(
                    slot,
                    player = %slot_name,
                    seed = %seed_name,
                    checked = checked_locations.len(),
                    "Remote session connected"
                );
                self.session = Some(SessionInfo {
                    slot,
                    slot_name: slot_name.clone(),
                    seed_name,
                    checked_locations: checked_locations.into_iter().collect(),
                });
                self.reset_session();
                if let Some(death_link) = &mut self.death_link {
                    death_link.set_player(slot_name);
                }
                None
            }
            SessionEvent::Message(ServerMessage::ReceivedItems { index, items }) => {
                match self.received.apply(index, &items) {
                    ApplyOutcome::OutOfSync { expected, got } => {
                        warn!(expected, got, "Received items out of sync");
                        if !self.resync_requested {
                            self.resync_requested = true;
                            return Some(ClientMessage::Sync);
                        }
                    }
                    ApplyOutcome::Duplicate => {
                        debug!(index, "Duplicate received items");
                    }
                    outcome => {
                        debug!(index, total = self.received.len(), ?outcome, "Received items");
                        self.resync_requested = false;
                    }
                }
                None
            }
            SessionEvent::Message(message @ ServerMessage::Bounced { .. }) => {
                if let (Some(death_link), Some(death)) =
                    (&mut self.death_link, message.death_link())
                {
                    death_link.receive(death);
                }
                None
            }
        }
    }
}

/// Data storage key under which a counter is published
pub fn storage_key(slot: u32, counter: &str) -> String {
    format!("membridge_{}_{}", slot, counter)
}
