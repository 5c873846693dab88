//! Single-slot item delivery
//!
//! The target process exposes exactly one delivery slot: a payload field, an
//! optional extra payload word, a tag, a `ready` flag set by the bridge and an
//! `ack` flag set by the game once it consumed the payload. The index of the
//! next item to deliver (the cursor) lives in the target's own memory, so a
//! save file and its delivery progress always travel together.
//!
//! ```text
//!          cursor < received        payload + tag        ack observed
//!   Idle ───────────────────► Loaded ──────────► Awaiting ───────────► Idle
//!    │                        (then ready)                cursor + 1,
//!    │ counter / skip item                                clear ack
//!    └──► cursor + 1 without touching the slot
//! ```
//!
//! At most one item is in flight. The payload is always fully written before
//! `ready` is raised, and the cursor is only advanced after the game
//! acknowledged consumption.
//!
//! The tag holds the low bits of the delivered index. If the connection drops
//! between "ack observed" and "cursor written", the next session finds `ack`
//! still set and uses the tag to decide whether the cursor still has to move.
//!
//! Counter items never raise `ready`, but they leave the same trail: before
//! the unit is written the tag receives the index and the payload field the
//! counter value about to be written. The first pass after attaching uses it
//! to finish a unit that reached memory while its cursor write did not.
//!
//! A cursor that moves backwards means the game loaded an older save. The
//! counters went back with it, so their local view is dropped and the items
//! from the cursor on are delivered again.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::BridgeResult;
use crate::port::MemoryPort;
use crate::profile::{DeliverySlot, ItemCategory, ItemId};
use crate::progress::ProgressReconciler;
use crate::remote::ReceivedItems;
use crate::snapshot::TargetMemory;

/// Upper bound on queue steps taken in one tick
const MAX_STEPS_PER_TICK: usize = 64;

/// An item bound for the delivery slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryItem {
    /// Position in the received-items sequence
    pub index: usize,
    /// Remote item id
    pub item: ItemId,
    /// Value for the payload field
    pub code: u64,
    /// Value for the extra payload field
    pub extra: Option<u64>,
}

/// Delivery slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Nothing in flight
    #[default]
    Idle,
    /// Chosen for delivery; payload not yet written
    Loaded(DeliveryItem),
    /// Payload written and ready raised; waiting for the game's ack
    AwaitingConsumption(DeliveryItem),
}

impl SlotState {
    /// Item currently in flight
    pub fn in_flight(&self) -> Option<&DeliveryItem> {
        match self {
            SlotState::Idle => None,
            SlotState::Loaded(item) | SlotState::AwaitingConsumption(item) => Some(item),
        }
    }
}

/// Something the queue did during a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Payload written and ready raised
    Injected {
        /// Received-items index
        index: usize,
        /// Remote item id
        item: ItemId,
    },
    /// Game acknowledged the item; cursor advanced
    Consumed {
        /// Received-items index
        index: usize,
        /// Remote item id
        item: ItemId,
    },
    /// Counter item applied through the progress reconciler
    CounterApplied {
        /// Received-items index
        index: usize,
        /// Remote item id
        item: ItemId,
        /// Counter name
        counter: String,
    },
    /// Item has no representation in the target; cursor advanced
    Skipped {
        /// Received-items index
        index: usize,
        /// Remote item id
        item: ItemId,
    },
    /// Delivery of `index` interrupted by a lost connection and completed
    /// from what the target holds
    Recovered {
        /// Received-items index
        index: usize,
    },
}

/// FIFO delivery of received items through the single slot
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    slot: DeliverySlot,
    items: HashMap<ItemId, ItemCategory>,
    state: SlotState,
    warned_unknown: HashSet<ItemId>,
    warned_ahead: bool,
    last_cursor: Option<usize>,
    recovery_pending: bool,
}

impl DeliveryQueue {
    /// Create a queue for `slot` with the profile's item categories.
    pub fn new(slot: DeliverySlot, items: HashMap<ItemId, ItemCategory>) -> Self {
        Self {
            slot,
            items,
            state: SlotState::Idle,
            warned_unknown: HashSet::new(),
            warned_ahead: false,
            last_cursor: None,
            recovery_pending: true,
        }
    }

    /// Current slot state
    pub fn state(&self) -> &SlotState {
        &self.state
    }

    /// Discard anything in flight; it is re-derived from the cursor later.
    pub fn reset(&mut self) {
        if let Some(item) = self.state.in_flight() {
            debug!(index = item.index, "Discarding in-flight delivery");
        }
        self.state = SlotState::Idle;
        self.warned_ahead = false;
        self.last_cursor = None;
        self.recovery_pending = true;
    }

    /// Category of `item`; unknown items are logged once and skipped.
    pub fn category(&mut self, item: ItemId) -> ItemCategory {
        match self.items.get(&item) {
            Some(category) => category.clone(),
            None => {
                if self.warned_unknown.insert(item) {
                    warn!(item, "Item has no category in the profile, skipping");
                }
                ItemCategory::Skip
            }
        }
    }

    fn tag_for(&self, index: usize) -> u64 {
        index as u64 & self.slot.tag.max_value()
    }

    /// Advance the cursor past `index`, then drop both handshake flags.
    async fn finish<P: MemoryPort>(
        &self,
        mem: &mut TargetMemory<'_, P>,
        index: usize,
    ) -> BridgeResult<()> {
        mem.write_counter(&self.slot.cursor, index as u64 + 1)
            .await?;
        mem.set_bit(&self.slot.ready, false).await?;
        mem.set_bit(&self.slot.ack, false).await?;
        Ok(())
    }

    /// Run the slot state machine for one tick.
    pub async fn step<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
        received: &ReceivedItems,
        progress: &mut ProgressReconciler,
    ) -> BridgeResult<Vec<DeliveryEvent>> {
        let mut events = Vec::new();
        self.observe_cursor(mem, progress)?;
        if self.recovery_pending {
            self.recover_counter_unit(mem, received, progress, &mut events)
                .await?;
        }
        for _ in 0..MAX_STEPS_PER_TICK {
            if !self.advance(mem, received, progress, &mut events).await? {
                break;
            }
        }
        Ok(events)
    }

    /// Track the persisted cursor; a step backwards is a save reload.
    fn observe_cursor<P: MemoryPort>(
        &mut self,
        mem: &TargetMemory<'_, P>,
        progress: &mut ProgressReconciler,
    ) -> BridgeResult<()> {
        let cursor = mem.counter(&self.slot.cursor)? as usize;
        if let Some(previous) = self.last_cursor.replace(cursor) {
            if cursor < previous {
                info!(previous, cursor, "Delivery cursor moved back, save reloaded");
                if let Some(item) = self.state.in_flight() {
                    debug!(index = item.index, "Dropping delivery from the old save");
                }
                self.state = SlotState::Idle;
                self.recovery_pending = false;
                progress.reset();
            }
        }
        Ok(())
    }

    /// Finish a counter item whose unit reached memory before the previous
    /// connection could advance the cursor.
    async fn recover_counter_unit<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
        received: &ReceivedItems,
        progress: &ProgressReconciler,
        events: &mut Vec<DeliveryEvent>,
    ) -> BridgeResult<()> {
        let cursor = mem.counter(&self.slot.cursor)? as usize;
        let Some(item) = received.get(cursor) else {
            return Ok(());
        };
        self.recovery_pending = false;

        let Some(ItemCategory::Counter { counter }) = self.items.get(&item) else {
            return Ok(());
        };
        let Some(field) = progress.counter(counter).map(|c| *c.field()) else {
            return Ok(());
        };
        if mem.bit(&self.slot.ready)?
            || mem.bit(&self.slot.ack)?
            || mem.counter(&self.slot.tag)? != self.tag_for(cursor)
        {
            return Ok(());
        }
        let value = mem.counter(&field)?;
        let marked = mem.counter(&self.slot.payload)?;
        if value == 0 || (value & self.slot.payload.max_value()) != marked {
            return Ok(());
        }

        info!(index = cursor, item, counter = %counter, value, "Recovered applied counter item");
        mem.write_counter(&self.slot.cursor, cursor as u64 + 1)
            .await?;
        self.last_cursor = Some(cursor + 1);
        events.push(DeliveryEvent::Recovered { index: cursor });
        Ok(())
    }

    /// One transition. Returns whether another transition may follow in
    /// the same tick.
    async fn advance<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
        received: &ReceivedItems,
        progress: &mut ProgressReconciler,
        events: &mut Vec<DeliveryEvent>,
    ) -> BridgeResult<bool> {
        match self.state {
            SlotState::AwaitingConsumption(item) => {
                if !mem.bit(&self.slot.ack)? {
                    if !mem.bit(&self.slot.ready)? {
                        // taken down without an ack; an ack arriving late is
                        // still credited through the tag on the next pass
                        warn!(index = item.index, "Delivery slot cleared without acknowledgement");
                        self.state = SlotState::Idle;
                    }
                    return Ok(false);
                }
                self.finish(mem, item.index).await?;
                info!(index = item.index, item = item.item, "Item consumed");
                events.push(DeliveryEvent::Consumed {
                    index: item.index,
                    item: item.item,
                });
                self.state = SlotState::Idle;
                Ok(true)
            }
            SlotState::Loaded(item) => {
                mem.write_counter(&self.slot.payload, item.code).await?;
                if let (Some(field), Some(extra)) = (self.slot.extra, item.extra) {
                    mem.write_counter(&field, extra).await?;
                }
                mem.write_counter(&self.slot.tag, self.tag_for(item.index))
                    .await?;
                mem.set_bit(&self.slot.ready, true).await?;
                debug!(index = item.index, code = item.code, "Payload injected");
                events.push(DeliveryEvent::Injected {
                    index: item.index,
                    item: item.item,
                });
                self.state = SlotState::AwaitingConsumption(item);
                Ok(false)
            }
            SlotState::Idle => self.advance_idle(mem, received, progress, events).await,
        }
    }

    async fn advance_idle<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
        received: &ReceivedItems,
        progress: &mut ProgressReconciler,
        events: &mut Vec<DeliveryEvent>,
    ) -> BridgeResult<bool> {
        let cursor = mem.counter(&self.slot.cursor)? as usize;

        if mem.bit(&self.slot.ack)? {
            // ack left over from an interrupted handshake
            let tag = mem.counter(&self.slot.tag)?;
            if tag == self.tag_for(cursor) {
                info!(index = cursor, "Recovered acknowledged delivery");
                self.finish(mem, cursor).await?;
                events.push(DeliveryEvent::Recovered { index: cursor });
            } else {
                debug!(cursor, tag, "Clearing stale acknowledgement");
                mem.set_bit(&self.slot.ack, false).await?;
            }
            return Ok(true);
        }

        if cursor > received.len() {
            if !self.warned_ahead {
                warn!(
                    cursor,
                    received = received.len(),
                    "Target cursor is ahead of the received items"
                );
                self.warned_ahead = true;
            }
            return Ok(false);
        }
        let Some(item) = received.get(cursor) else {
            return Ok(false);
        };

        match self.category(item) {
            ItemCategory::Slot { code } => {
                self.load(mem, cursor, item, code, None)
            }
            ItemCategory::SlotWithPayload { code, extra } => {
                self.load(mem, cursor, item, code, Some(extra))
            }
            ItemCategory::Counter { counter } => {
                if let Some(value) = progress.unit_target(mem, &counter)? {
                    mem.write_counter(&self.slot.payload, value & self.slot.payload.max_value())
                        .await?;
                    mem.write_counter(&self.slot.tag, self.tag_for(cursor))
                        .await?;
                }
                if !progress.apply_unit(mem, &counter).await? {
                    return Ok(false);
                }
                mem.write_counter(&self.slot.cursor, cursor as u64 + 1)
                    .await?;
                info!(index = cursor, item, counter = %counter, "Counter item applied");
                events.push(DeliveryEvent::CounterApplied {
                    index: cursor,
                    item,
                    counter,
                });
                Ok(true)
            }
            ItemCategory::Skip => {
                mem.write_counter(&self.slot.cursor, cursor as u64 + 1)
                    .await?;
                debug!(index = cursor, item, "Item skipped");
                events.push(DeliveryEvent::Skipped {
                    index: cursor,
                    item,
                });
                Ok(true)
            }
        }
    }

    fn load<P: MemoryPort>(
        &mut self,
        mem: &TargetMemory<'_, P>,
        index: usize,
        item: ItemId,
        code: u64,
        extra: Option<u64>,
    ) -> BridgeResult<bool> {
        let candidate = DeliveryItem {
            index,
            item,
            code,
            extra,
        };
        if mem.bit(&self.slot.ready)? {
            // an earlier connection already injected this index; keep waiting
            // for the game instead of rewriting the payload under it
            if mem.counter(&self.slot.tag)? == self.tag_for(index) {
                debug!(index, "Adopting in-flight delivery");
                self.state = SlotState::AwaitingConsumption(candidate);
                return Ok(false);
            }
            warn!(index, "Ready flag set for an unknown payload, reloading");
        }
        self.state = SlotState::Loaded(candidate);
        Ok(true)
    }
}
