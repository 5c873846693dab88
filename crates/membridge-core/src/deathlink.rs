//! Death relay between the session and the target process
//!
//! Incoming deaths (bounces tagged `DeathLink` from other players) are
//! queued and written into the target one at a time: message, then source,
//! then the incoming flag. The next one is only written after the game
//! cleared the flag.
//!
//! Outgoing deaths are signalled by the game through its own flag. The bridge
//! relays it to the session unless another death was relayed or delivered
//! within the cooldown, then clears the flag either way.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::BridgeResult;
use crate::port::MemoryPort;
use crate::profile::DeathLinkSlot;
use crate::remote::{ClientMessage, DeathLinkData};
use crate::snapshot::TargetMemory;

/// What the death link did during one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeathLinkStep {
    /// Death written into the target
    pub delivered: Option<DeathLinkData>,
    /// Bounce to send for a local death
    pub outgoing: Option<ClientMessage>,
    /// A local death was swallowed by the cooldown
    pub suppressed: bool,
}

/// Relays deaths in both directions
#[derive(Debug, Clone)]
pub struct DeathLinkBridge {
    slot: DeathLinkSlot,
    cooldown: Duration,
    player: Option<String>,
    pending: VecDeque<DeathLinkData>,
    last_relay: Option<Instant>,
}

impl DeathLinkBridge {
    /// Create a relay for `slot`.
    pub fn new(slot: DeathLinkSlot, cooldown: Duration) -> Self {
        Self {
            slot,
            cooldown,
            player: None,
            pending: VecDeque::new(),
            last_relay: None,
        }
    }

    /// Name used as the source of outgoing deaths; bounces carrying it are
    /// our own echo and are ignored.
    pub fn set_player(&mut self, name: impl Into<String>) {
        self.player = Some(name.into());
    }

    /// Number of incoming deaths not yet written
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop queued deaths and the cooldown (session ended).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_relay = None;
    }

    /// Queue a death received from the session.
    pub fn receive(&mut self, death: DeathLinkData) {
        if self.player.as_deref() == Some(death.source.as_str()) {
            debug!(source = %death.source, "Ignoring own death echo");
            return;
        }
        info!(source = %death.source, cause = %death.cause, "Death received");
        self.pending.push_back(death);
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_relay
            .is_some_and(|at| now.duration_since(at) < self.cooldown)
    }

    /// Deliver at most one incoming death and pick up a local one.
    pub async fn step<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
    ) -> BridgeResult<DeathLinkStep> {
        let mut step = DeathLinkStep::default();

        if let Some(death) = self.pending.front() {
            if !mem.bit(&self.slot.incoming)? {
                let message = if death.cause.is_empty() {
                    format!("{} died", death.source)
                } else {
                    death.cause.clone()
                };
                mem.write_bytes(&self.slot.message, message.as_bytes())
                    .await?;
                mem.write_bytes(&self.slot.source, death.source.as_bytes())
                    .await?;
                mem.set_bit(&self.slot.incoming, true).await?;

                self.last_relay = Some(Instant::now());
                step.delivered = self.pending.pop_front();
            }
        }

        if mem.bit(&self.slot.outgoing)? {
            let now = Instant::now();
            if self.cooling_down(now) {
                debug!("Local death within cooldown, not relayed");
                step.suppressed = true;
            } else {
                let source = self.player.clone().unwrap_or_default();
                info!(source = %source, "Relaying local death");
                step.outgoing = Some(ClientMessage::death_link(
                    format!("{} died", source),
                    source,
                ));
                self.last_relay = Some(now);
            }
            mem.set_bit(&self.slot.outgoing, false).await?;
        }

        Ok(step)
    }
}
