//! Game profiles: the region/offset table of one target build
//!
//! A profile is the "wire format" of the target process's runtime state: which
//! memory regions exist, where each symbolic flag lives inside them, and which
//! flags form the delivery slot, the session identifier, the death-link
//! channel and so on. Profiles are static, versioned JSON documents.
//!
//! ```json
//! {
//!   "version": 1,
//!   "game": "Example",
//!   "regions": [{ "id": "save", "base": "0x1000", "len": 64 }],
//!   "flags": [
//!     { "id": "boss_1", "region": "save", "kind": "toggle", "index": 19 },
//!     { "id": "cursor", "region": "save", "kind": "counter", "offset": 8, "width": 2 }
//!   ],
//!   ...
//! }
//! ```
//!
//! Loading goes through [`GameProfile::resolve`], which turns symbolic ids
//! into concrete addresses. Problems with the required layout (session id,
//! delivery slot) reject the whole profile; problems with an individual
//! location or counter only skip that entry and are reported in
//! [`ResolvedProfile::skipped`].

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::{self, BitLocation, BitOrder, Endianness, MAX_COUNTER_WIDTH};
use crate::error::{BridgeResult, ProfileError};

/// Profile format version understood by this build
pub const PROFILE_VERSION: u32 = 1;

/// Location ids as assigned by the remote session
pub type LocationId = u64;

/// Item ids as assigned by the remote session
pub type ItemId = u64;

/// Accept addresses either as JSON numbers or as `"0x..."` strings.
fn address<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => {
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid address '{}': {}", s, e)))
        }
    }
}

/// A contiguous memory region of the target process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDef {
    /// Region id referenced by flags
    pub id: String,
    /// Absolute base address
    #[serde(deserialize_with = "address")]
    pub base: u32,
    /// Length in bytes
    pub len: u32,
    /// Byte order of counters in this region
    #[serde(default)]
    pub endianness: Endianness,
    /// Bit numbering of toggles in this region
    #[serde(default)]
    pub bit_order: BitOrder,
}

/// Storage kind of a symbolic flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlagKind {
    /// Single bit; `index` counts bits from the region base
    Toggle {
        /// Bit index relative to the region base
        index: u32,
    },
    /// Unsigned counter of `width` bytes at `offset`
    Counter {
        /// Byte offset relative to the region base
        offset: u32,
        /// Width in bytes (1..=8)
        width: u32,
    },
    /// Raw byte array
    Bytes {
        /// Byte offset relative to the region base
        offset: u32,
        /// Length in bytes
        len: u32,
    },
}

/// A symbolic flag: immutable configuration, never runtime state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDef {
    /// Symbolic id
    pub id: String,
    /// Region the offsets are relative to
    pub region: String,
    /// Storage kind and position
    #[serde(flatten)]
    pub kind: FlagKind,
}

/// How a granted item is represented in the target process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemCategory {
    /// Delivered through the slot as a single item code
    Slot {
        /// Code written to the payload field
        code: u64,
    },
    /// Delivered through the slot with an extra payload word
    SlotWithPayload {
        /// Code written to the payload field
        code: u64,
        /// Value written to the extra payload field
        extra: u64,
    },
    /// Increments a progress counter instead of using the slot
    Counter {
        /// Name of the progress counter
        counter: String,
    },
    /// No representation in the target process
    Skip,
}

/// Mapping of a remote item id to its category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDef {
    /// Remote item id
    pub id: ItemId,
    /// How the item is delivered
    #[serde(flatten)]
    pub category: ItemCategory,
}

/// A toggle-style location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDef {
    /// Remote location id
    pub id: LocationId,
    /// Toggle flag that is set once the location is checked
    pub flag: String,
}

/// A counter-style location group
///
/// Unit `n` of the counter maps to location `first_location + n - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationGroupDef {
    /// Group name (for logs)
    pub name: String,
    /// Counter flag holding the completion count
    pub flag: String,
    /// Location id of the first unit
    pub first_location: LocationId,
    /// Number of checks the session has for this group
    pub max_checks: u64,
}

/// A bridge-tracked progress counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDef {
    /// Counter name referenced by `ItemCategory::Counter`
    pub name: String,
    /// Counter flag in memory
    pub flag: String,
}

/// Flags forming the single-item delivery slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLayout {
    /// Counter field receiving the item code
    pub payload: String,
    /// Optional counter field receiving the extra payload word
    #[serde(default)]
    pub extra: Option<String>,
    /// Counter field receiving the low bits of the delivered index
    pub tag: String,
    /// Toggle set by the bridge once the payload is complete
    pub ready: String,
    /// Toggle set by the game once it consumed the payload
    pub ack: String,
    /// Counter field persisting the received-item cursor
    pub cursor: String,
}

/// Flags forming the death-link channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathLinkLayout {
    /// Toggle the bridge sets to kill the player
    pub incoming: String,
    /// Byte array receiving the cause message
    pub message: String,
    /// Byte array receiving the source player name
    pub source: String,
    /// Toggle the game sets when the player died
    pub outgoing: String,
}

/// A profile as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    /// Format version, must equal [`PROFILE_VERSION`]
    pub version: u32,
    /// Game name, used for logs
    pub game: String,
    /// Memory regions
    pub regions: Vec<RegionDef>,
    /// Symbolic flags
    pub flags: Vec<FlagDef>,
    /// Byte-array flag holding the session identifier
    pub session: String,
    /// Delivery slot layout
    pub delivery: DeliveryLayout,
    /// Progress counters
    #[serde(default)]
    pub counters: Vec<CounterDef>,
    /// Toggle-style locations
    #[serde(default)]
    pub locations: Vec<LocationDef>,
    /// Counter-style location groups
    #[serde(default)]
    pub location_groups: Vec<LocationGroupDef>,
    /// Item categories
    #[serde(default)]
    pub items: Vec<ItemDef>,
    /// Death-link channel, if the game supports it
    #[serde(default)]
    pub death_link: Option<DeathLinkLayout>,
    /// Toggle the game sets while location checks are waiting to be sent
    #[serde(default)]
    pub pending_checks: Option<String>,
    /// Toggle set once the player reached the goal
    #[serde(default)]
    pub goal: Option<String>,
}

/// Concrete counter position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterField {
    /// Absolute address of the first byte
    pub address: u32,
    /// Width in bytes
    pub width: usize,
    /// Byte order
    pub endianness: Endianness,
}

impl CounterField {
    /// Largest value this field can hold
    pub fn max_value(&self) -> u64 {
        codec::max_value(self.width)
    }
}

/// Concrete byte-array position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BytesField {
    /// Absolute address of the first byte
    pub address: u32,
    /// Length in bytes
    pub len: u32,
}

/// A flag resolved to an absolute position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFlag {
    /// Single bit
    Bit(BitLocation),
    /// Unsigned counter
    Counter(CounterField),
    /// Byte array
    Bytes(BytesField),
}

/// Resolved delivery slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySlot {
    /// Item code field
    pub payload: CounterField,
    /// Extra payload word
    pub extra: Option<CounterField>,
    /// Delivered-index tag field
    pub tag: CounterField,
    /// "New item present" flag (bridge → game)
    pub ready: BitLocation,
    /// "Item consumed" flag (game → bridge)
    pub ack: BitLocation,
    /// Persisted received-item cursor
    pub cursor: CounterField,
}

/// Resolved death-link channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathLinkSlot {
    /// Incoming death flag
    pub incoming: BitLocation,
    /// Cause message field
    pub message: BytesField,
    /// Source name field
    pub source: BytesField,
    /// Outgoing death flag
    pub outgoing: BitLocation,
}

/// Resolved counter location group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    /// Group name
    pub name: String,
    /// Completion counter
    pub field: CounterField,
    /// Location id of unit 1
    pub first_location: LocationId,
    /// Check budget
    pub max_checks: u64,
}

impl ResolvedGroup {
    /// Whether `location` belongs to this group
    pub fn contains(&self, location: LocationId) -> bool {
        location >= self.first_location && location - self.first_location < self.max_checks
    }
}

/// A profile with every symbolic id turned into an absolute position
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    /// Game name
    pub game: String,
    /// Memory regions, read once per tick
    pub regions: Vec<RegionDef>,
    /// Session id field
    pub session: BytesField,
    /// Delivery slot
    pub delivery: DeliverySlot,
    /// Progress counters by name
    pub counters: Vec<(String, CounterField)>,
    /// Toggle locations
    pub locations: Vec<(LocationId, BitLocation)>,
    /// Counter location groups
    pub groups: Vec<ResolvedGroup>,
    /// Item categories
    pub items: HashMap<ItemId, ItemCategory>,
    /// Death-link channel
    pub death_link: Option<DeathLinkSlot>,
    /// Pending-checks flag
    pub pending_checks: Option<BitLocation>,
    /// Goal flag
    pub goal: Option<BitLocation>,
    /// Entries that could not be resolved and are ignored
    pub skipped: Vec<ProfileError>,
}

impl GameProfile {
    /// Parse a profile from JSON text.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a profile from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn region(&self, id: &str, field: &str) -> Result<&RegionDef, ProfileError> {
        self.regions
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ProfileError::UnknownRegion {
                region: id.to_string(),
                field: field.to_string(),
            })
    }

    /// Resolve one flag id to an absolute position.
    pub fn resolve_flag(&self, id: &str) -> Result<ResolvedFlag, ProfileError> {
        let flag = self
            .flags
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| ProfileError::UnknownFlag(id.to_string()))?;
        let region = self.region(&flag.region, id)?;
        let out_of_range = || ProfileError::OutOfRange {
            field: id.to_string(),
            region: region.id.clone(),
        };

        match flag.kind {
            FlagKind::Toggle { index } => {
                if index / 8 >= region.len {
                    return Err(out_of_range());
                }
                Ok(ResolvedFlag::Bit(codec::locate(
                    index,
                    region.base,
                    region.bit_order,
                )))
            }
            FlagKind::Counter { offset, width } => {
                if width == 0 || width as usize > MAX_COUNTER_WIDTH {
                    return Err(ProfileError::InvalidWidth {
                        field: id.to_string(),
                        width,
                    });
                }
                if u64::from(offset) + u64::from(width) > u64::from(region.len) {
                    return Err(out_of_range());
                }
                Ok(ResolvedFlag::Counter(CounterField {
                    address: region.base + offset,
                    width: width as usize,
                    endianness: region.endianness,
                }))
            }
            FlagKind::Bytes { offset, len } => {
                if u64::from(offset) + u64::from(len) > u64::from(region.len) {
                    return Err(out_of_range());
                }
                Ok(ResolvedFlag::Bytes(BytesField {
                    address: region.base + offset,
                    len,
                }))
            }
        }
    }

    /// Resolve a flag that must be a toggle.
    pub fn resolve_bit(&self, id: &str) -> Result<BitLocation, ProfileError> {
        match self.resolve_flag(id)? {
            ResolvedFlag::Bit(loc) => Ok(loc),
            _ => Err(ProfileError::WrongKind {
                flag: id.to_string(),
                expected: "toggle",
            }),
        }
    }

    /// Resolve a flag that must be a counter.
    pub fn resolve_counter(&self, id: &str) -> Result<CounterField, ProfileError> {
        match self.resolve_flag(id)? {
            ResolvedFlag::Counter(field) => Ok(field),
            _ => Err(ProfileError::WrongKind {
                flag: id.to_string(),
                expected: "counter",
            }),
        }
    }

    /// Resolve a flag that must be a byte array.
    pub fn resolve_bytes(&self, id: &str) -> Result<BytesField, ProfileError> {
        match self.resolve_flag(id)? {
            ResolvedFlag::Bytes(field) => Ok(field),
            _ => Err(ProfileError::WrongKind {
                flag: id.to_string(),
                expected: "byte array",
            }),
        }
    }

    fn check_duplicates(&self) -> Result<(), ProfileError> {
        fn unique(ids: impl Iterator<Item = String>) -> Result<(), ProfileError> {
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id.clone()) {
                    return Err(ProfileError::Duplicate(id));
                }
            }
            Ok(())
        }

        unique(self.regions.iter().map(|r| r.id.clone()))?;
        unique(self.flags.iter().map(|f| f.id.clone()))?;
        unique(self.counters.iter().map(|c| c.name.clone()))?;
        unique(self.items.iter().map(|i| format!("item:{}", i.id)))?;
        unique(self.locations.iter().map(|l| format!("location:{}", l.id)))?;
        Ok(())
    }

    /// Validate and resolve the whole profile.
    ///
    /// Fails on version mismatch, duplicate ids, or any problem in the
    /// required layout (session id, delivery slot, death link, goal).
    /// Individual counters, locations and groups that fail to resolve are
    /// collected in [`ResolvedProfile::skipped`] instead.
    pub fn resolve(&self) -> Result<ResolvedProfile, ProfileError> {
        if self.version != PROFILE_VERSION {
            return Err(ProfileError::UnsupportedVersion {
                expected: PROFILE_VERSION,
                found: self.version,
            });
        }
        self.check_duplicates()?;
        for region in &self.regions {
            if u64::from(region.base) + u64::from(region.len) > u64::from(u32::MAX) + 1 {
                return Err(ProfileError::OutOfRange {
                    field: region.id.clone(),
                    region: region.id.clone(),
                });
            }
        }

        let session = self.resolve_bytes(&self.session)?;
        let d = &self.delivery;
        let delivery = DeliverySlot {
            payload: self.resolve_counter(&d.payload)?,
            extra: d
                .extra
                .as_deref()
                .map(|id| self.resolve_counter(id))
                .transpose()?,
            tag: self.resolve_counter(&d.tag)?,
            ready: self.resolve_bit(&d.ready)?,
            ack: self.resolve_bit(&d.ack)?,
            cursor: self.resolve_counter(&d.cursor)?,
        };
        let death_link = self
            .death_link
            .as_ref()
            .map(|dl| -> Result<DeathLinkSlot, ProfileError> {
                Ok(DeathLinkSlot {
                    incoming: self.resolve_bit(&dl.incoming)?,
                    message: self.resolve_bytes(&dl.message)?,
                    source: self.resolve_bytes(&dl.source)?,
                    outgoing: self.resolve_bit(&dl.outgoing)?,
                })
            })
            .transpose()?;
        let pending_checks = self
            .pending_checks
            .as_deref()
            .map(|id| self.resolve_bit(id))
            .transpose()?;
        let goal = self
            .goal
            .as_deref()
            .map(|id| self.resolve_bit(id))
            .transpose()?;

        let mut skipped = Vec::new();

        let mut counters = Vec::new();
        for def in &self.counters {
            match self.resolve_counter(&def.flag) {
                Ok(field) => counters.push((def.name.clone(), field)),
                Err(e) => skipped.push(e),
            }
        }

        let mut locations = Vec::new();
        for def in &self.locations {
            match self.resolve_bit(&def.flag) {
                Ok(loc) => locations.push((def.id, loc)),
                Err(e) => skipped.push(e),
            }
        }

        let mut groups = Vec::new();
        for def in &self.location_groups {
            match self.resolve_counter(&def.flag) {
                Ok(field) => groups.push(ResolvedGroup {
                    name: def.name.clone(),
                    field,
                    first_location: def.first_location,
                    max_checks: def.max_checks,
                }),
                Err(e) => skipped.push(e),
            }
        }

        let mut items = HashMap::new();
        for def in &self.items {
            if let ItemCategory::Counter { counter } = &def.category {
                if !counters.iter().any(|(name, _)| name == counter) {
                    skipped.push(ProfileError::UnknownFlag(format!(
                        "counter '{}' for item {}",
                        counter, def.id
                    )));
                    continue;
                }
            }
            items.insert(def.id, def.category.clone());
        }

        Ok(ResolvedProfile {
            game: self.game.clone(),
            regions: self.regions.clone(),
            session,
            delivery,
            counters,
            locations,
            groups,
            items,
            death_link,
            pending_checks,
            goal,
            skipped,
        })
    }
}
