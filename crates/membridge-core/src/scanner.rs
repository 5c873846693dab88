//! Location scanning
//!
//! Turns the memory snapshot into newly checked location ids. Two kinds of
//! locations exist:
//!
//! - toggle locations: one bit each, reported the first time the bit is set
//! - counter groups: a completion counter whose units map to consecutive
//!   location ids (`first_location + unit - 1`), limited to a check budget
//!
//! Every reported id is remembered in the [`CheckedLocationSet`], so scanning
//! the same snapshot twice yields an empty second batch.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::codec::BitLocation;
use crate::error::BridgeResult;
use crate::port::MemoryPort;
use crate::profile::{LocationId, ResolvedGroup};
use crate::snapshot::{MemorySnapshot, TargetMemory};

/// Location ids already reported in this session; append-only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckedLocationSet {
    ids: BTreeSet<LocationId>,
}

impl CheckedLocationSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` was reported
    pub fn contains(&self, id: LocationId) -> bool {
        self.ids.contains(&id)
    }

    /// Record `id`; returns whether it was new.
    pub fn insert(&mut self, id: LocationId) -> bool {
        self.ids.insert(id)
    }

    /// Number of reported ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing was reported
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Reported ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.ids.iter().copied()
    }

    /// Forget everything before a rebuild.
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl Extend<LocationId> for CheckedLocationSet {
    fn extend<T: IntoIterator<Item = LocationId>>(&mut self, iter: T) {
        self.ids.extend(iter);
    }
}

/// Reporting state of one counter group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProgress {
    group: ResolvedGroup,
    last_sent: u64,
    /// Units (1-based) whose location id is known as checked
    known: BTreeSet<u64>,
}

impl GroupProgress {
    /// Fresh progress for `group`
    pub fn new(group: ResolvedGroup) -> Self {
        Self {
            group,
            last_sent: 0,
            known: BTreeSet::new(),
        }
    }

    /// Group definition
    pub fn group(&self) -> &ResolvedGroup {
        &self.group
    }

    /// Counter value up to which completions have been handled
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    /// Checks still allowed
    pub fn remaining(&self) -> u64 {
        self.group
            .max_checks
            .saturating_sub(self.known.len() as u64)
    }

    /// Rebuild from the ids the session knows as checked.
    ///
    /// Completions are assumed up to the highest unit reachable without a
    /// gap, so a unit missing in between is still reported later.
    pub fn seed(&mut self, checked: impl IntoIterator<Item = LocationId>) {
        let first = self.group.first_location;
        self.known = checked
            .into_iter()
            .filter(|&id| self.group.contains(id))
            .map(|id| id - first + 1)
            .collect();
        self.last_sent = (1..)
            .take_while(|unit| self.known.contains(unit))
            .count() as u64;
    }

    /// Location ids for the completions between `last_sent` and `current`.
    ///
    /// Units already known are passed over. At most
    /// [`remaining`](Self::remaining) ids are produced; completions past the
    /// budget are absorbed without a report.
    pub fn advance(&mut self, current: u64) -> Vec<LocationId> {
        if current <= self.last_sent {
            return Vec::new();
        }
        let mut ids = Vec::new();
        for unit in self.last_sent + 1..=current {
            if self.remaining() == 0 {
                break;
            }
            if self.known.insert(unit) {
                ids.push(self.group.first_location + (unit - 1));
            }
        }
        self.last_sent = current;
        ids
    }
}

/// Reports checked locations from memory
#[derive(Debug, Clone)]
pub struct LocationScanner {
    locations: Vec<(LocationId, BitLocation)>,
    groups: Vec<GroupProgress>,
    pending: Option<BitLocation>,
    checked: CheckedLocationSet,
}

impl LocationScanner {
    /// Create a scanner over toggle `locations` and counter `groups`.
    ///
    /// `pending` is the game's "new checks pending" flag, cleared after
    /// every scan that finds it set.
    pub fn new(
        locations: Vec<(LocationId, BitLocation)>,
        groups: Vec<ResolvedGroup>,
        pending: Option<BitLocation>,
    ) -> Self {
        Self {
            locations,
            groups: groups.into_iter().map(GroupProgress::new).collect(),
            pending,
            checked: CheckedLocationSet::new(),
        }
    }

    /// Ids reported so far
    pub fn checked(&self) -> &CheckedLocationSet {
        &self.checked
    }

    /// Group progress, in profile order
    pub fn groups(&self) -> &[GroupProgress] {
        &self.groups
    }

    /// Forget all local state.
    pub fn reset(&mut self) {
        self.checked.clear();
        for progress in &mut self.groups {
            progress.seed(std::iter::empty());
        }
    }

    /// Rebuild from the ids the session knows as checked. The next scan
    /// re-derives everything else from memory.
    pub fn seed(&mut self, session_checked: impl IntoIterator<Item = LocationId>) {
        self.reset();
        self.checked.extend(session_checked);
        for progress in &mut self.groups {
            progress.seed(self.checked.iter());
        }
        debug!(known = self.checked.len(), "Seeded checked locations");
    }

    /// Collect the ids that became checked since the previous scan.
    pub fn scan(&mut self, snapshot: &MemorySnapshot) -> BTreeSet<LocationId> {
        let mut batch = BTreeSet::new();

        for (id, loc) in &self.locations {
            if self.checked.contains(*id) {
                continue;
            }
            if snapshot.bit(loc) == Some(true) && self.checked.insert(*id) {
                batch.insert(*id);
            }
        }

        for progress in &mut self.groups {
            let Some(current) = snapshot.counter(&progress.group.field) else {
                continue;
            };
            for id in progress.advance(current) {
                if self.checked.insert(id) {
                    batch.insert(id);
                }
            }
        }

        if !batch.is_empty() {
            info!(count = batch.len(), "New locations checked");
        }
        batch
    }

    /// Clear the game's pending-checks flag if it is set.
    pub async fn clear_pending<P: MemoryPort>(
        &self,
        mem: &mut TargetMemory<'_, P>,
    ) -> BridgeResult<bool> {
        let Some(flag) = &self.pending else {
            return Ok(false);
        };
        if !mem.bit(flag)? {
            return Ok(false);
        }
        mem.set_bit(flag, false).await
    }
}
