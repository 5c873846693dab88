//! Monotone progress counters shared between the bridge and gameplay
//!
//! Some counters ("macguffins collected") can be advanced both by the bridge
//! (a granted counter item) and by the game itself. The bridge tracks its own
//! view `l` and compares it with the value `m` read from memory:
//!
//! | state   | action                                               |
//! |---------|------------------------------------------------------|
//! | `m == l`| apply a pending unit, if any: write `m + 1`          |
//! | `m > l` | gameplay advanced it: adopt `l = m`, no write        |
//! | `m < l` | memory regressed: write `l` back and log, never fail |
//!
//! The value the rest of the system sees is `max(l, m)`, which never
//! decreases.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::BridgeResult;
use crate::port::MemoryPort;
use crate::profile::CounterField;
use crate::snapshot::TargetMemory;

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing to do
    Unchanged,
    /// A unit was applied; `value` must be written
    Applied {
        /// New counter value
        value: u64,
    },
    /// Gameplay advanced the counter; local state follows
    Adopted {
        /// Value adopted from memory
        value: u64,
    },
    /// Memory was below the local value; `value` must be written back
    Repaired {
        /// Local value to restore
        value: u64,
        /// Value found in memory
        memory: u64,
    },
    /// The counter is at its maximum; the unit is dropped
    Saturated {
        /// Counter value (its maximum)
        value: u64,
    },
}

impl Reconciliation {
    /// Value that has to be written to memory, if any
    pub fn write(&self) -> Option<u64> {
        match *self {
            Reconciliation::Applied { value } | Reconciliation::Repaired { value, .. } => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Whether a pending unit was consumed
    pub fn consumed_unit(&self) -> bool {
        matches!(
            self,
            Reconciliation::Applied { .. } | Reconciliation::Saturated { .. }
        )
    }
}

/// A named monotone counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressCounter {
    name: String,
    field: CounterField,
    local: u64,
}

impl ProgressCounter {
    /// New counter with local value 0
    pub fn new(name: impl Into<String>, field: CounterField) -> Self {
        Self {
            name: name.into(),
            field,
            local: 0,
        }
    }

    /// Counter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Memory field
    pub fn field(&self) -> &CounterField {
        &self.field
    }

    /// Locally tracked value
    pub fn local(&self) -> u64 {
        self.local
    }

    /// Externally visible value given the memory value
    pub fn value(&self, memory: u64) -> u64 {
        self.local.max(memory)
    }

    /// Forget local state (after a reconnect).
    pub fn reset(&mut self) {
        self.local = 0;
    }

    /// Decide what to do for memory value `memory`.
    ///
    /// `apply_unit` asks for one bridge-driven increment; it is only applied
    /// when memory and local state agree.
    pub fn reconcile(&mut self, memory: u64, apply_unit: bool) -> Reconciliation {
        match memory.cmp(&self.local) {
            Ordering::Equal if apply_unit => {
                if memory >= self.field.max_value() {
                    return Reconciliation::Saturated { value: memory };
                }
                self.local = memory + 1;
                Reconciliation::Applied { value: self.local }
            }
            Ordering::Equal => Reconciliation::Unchanged,
            Ordering::Greater => {
                self.local = memory;
                Reconciliation::Adopted { value: memory }
            }
            Ordering::Less => Reconciliation::Repaired {
                value: self.local,
                memory,
            },
        }
    }
}

/// All progress counters of one bridge session
#[derive(Debug, Clone, Default)]
pub struct ProgressReconciler {
    counters: Vec<ProgressCounter>,
    published: BTreeMap<String, u64>,
    changed: BTreeMap<String, u64>,
}

impl ProgressReconciler {
    /// Build from resolved `(name, field)` pairs.
    pub fn new(defs: &[(String, CounterField)]) -> Self {
        Self {
            counters: defs
                .iter()
                .map(|(name, field)| ProgressCounter::new(name.clone(), *field))
                .collect(),
            published: BTreeMap::new(),
            changed: BTreeMap::new(),
        }
    }

    /// Look up a counter by name.
    pub fn counter(&self, name: &str) -> Option<&ProgressCounter> {
        self.counters.iter().find(|c| c.name == name)
    }

    /// Iterate over all counters.
    pub fn counters(&self) -> impl Iterator<Item = &ProgressCounter> {
        self.counters.iter()
    }

    /// Forget local state of every counter (after a reconnect or a save
    /// reload); the next reconciliation adopts whatever memory holds.
    ///
    /// Published values are kept: a value that is re-derived unchanged from
    /// memory is not sent again.
    pub fn reset(&mut self) {
        self.counters.iter_mut().for_each(ProgressCounter::reset);
    }

    /// Forget what was published (new remote session).
    pub fn forget_published(&mut self) {
        self.published.clear();
        self.changed.clear();
    }

    /// Counters whose visible value differs from the last one handed out,
    /// by name. A counter never seen before counts as published at 0.
    pub fn take_changes(&mut self) -> BTreeMap<String, u64> {
        std::mem::take(&mut self.changed)
    }

    async fn reconcile_at<P: MemoryPort>(
        &mut self,
        idx: usize,
        mem: &mut TargetMemory<'_, P>,
        apply_unit: bool,
    ) -> BridgeResult<Reconciliation> {
        let field = self.counters[idx].field;
        let memory = mem.counter(&field)?;
        let counter = &mut self.counters[idx];
        let outcome = counter.reconcile(memory, apply_unit);

        match outcome {
            Reconciliation::Repaired { value, memory } => warn!(
                counter = %counter.name,
                local = value,
                memory,
                "Counter regressed in memory, restoring local value"
            ),
            Reconciliation::Saturated { value } => warn!(
                counter = %counter.name,
                value,
                "Counter saturated, dropping unit"
            ),
            Reconciliation::Adopted { value } => {
                debug!(counter = %counter.name, value, "Adopted gameplay progress")
            }
            _ => {}
        }

        let visible = counter.value(outcome.write().unwrap_or(memory));
        let published = self.published.get(&counter.name).copied().unwrap_or(0);
        if visible != published {
            self.published.insert(counter.name.clone(), visible);
            self.changed.insert(counter.name.clone(), visible);
        }
        if let Some(value) = outcome.write() {
            mem.write_counter(&field, value).await?;
        }
        Ok(outcome)
    }

    /// Value `name` takes if a unit is applied now; `None` while the unit
    /// would be deferred or dropped.
    pub fn unit_target<P: MemoryPort>(
        &self,
        mem: &TargetMemory<'_, P>,
        name: &str,
    ) -> BridgeResult<Option<u64>> {
        let Some(counter) = self.counter(name) else {
            return Ok(None);
        };
        let memory = mem.counter(&counter.field)?;
        let ready = memory == counter.local && memory < counter.field.max_value();
        Ok(ready.then_some(memory + 1))
    }

    /// Apply one bridge-driven unit to `name`.
    ///
    /// Returns whether the unit was consumed. When memory is ahead of or
    /// behind the local value the counter is reconciled first and the unit
    /// stays pending for the next tick.
    pub async fn apply_unit<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
        name: &str,
    ) -> BridgeResult<bool> {
        let Some(idx) = self.counters.iter().position(|c| c.name == name) else {
            warn!(counter = %name, "Unknown progress counter");
            return Ok(false);
        };
        let outcome = self.reconcile_at(idx, mem, true).await?;
        Ok(outcome.consumed_unit())
    }

    /// Reconcile every counter without applying units.
    pub async fn step<P: MemoryPort>(
        &mut self,
        mem: &mut TargetMemory<'_, P>,
    ) -> BridgeResult<Vec<(String, Reconciliation)>> {
        let mut outcomes = Vec::new();
        for idx in 0..self.counters.len() {
            let outcome = self.reconcile_at(idx, mem, false).await?;
            if outcome != Reconciliation::Unchanged {
                outcomes.push((self.counters[idx].name.clone(), outcome));
            }
        }
        Ok(outcomes)
    }
}
