//! Memory snapshots and write-through access
//!
//! A [`MemorySnapshot`] is the bridge's copy of every scanned region, taken
//! once per tick. It is captured region by region into a fresh map and only
//! handed out once every read succeeded, so no component ever acts on a torn
//! read.
//!
//! [`TargetMemory`] pairs the snapshot with the port for the duration of a
//! tick. Reads come from the snapshot; writes go to the port and are then
//! recorded in the snapshot, so later steps of the same tick see the bridge's
//! own writes. Single-bit writes re-read their byte right before writing, so
//! neighbouring bits the game changed since the snapshot are preserved.

use std::collections::HashMap;

use crate::codec::{self, BitLocation};
use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::port::MemoryPort;
use crate::profile::{BytesField, CounterField, RegionDef};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RegionBytes {
    base: u32,
    bytes: Vec<u8>,
}

impl RegionBytes {
    fn slice(&self, address: u32, len: u32) -> Option<&[u8]> {
        let offset = address.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len as usize)?;
        self.bytes.get(offset..end)
    }

    fn slice_mut(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
        let offset = address.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len)?;
        self.bytes.get_mut(offset..end)
    }
}

/// Last observed copy of every scanned region, keyed by region id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    regions: HashMap<String, RegionBytes>,
}

impl MemorySnapshot {
    /// Read every region through `port`.
    ///
    /// Either all regions are read or an error is returned; a partially
    /// filled snapshot is never produced.
    pub async fn capture<P: MemoryPort>(
        port: &mut P,
        regions: &[RegionDef],
    ) -> Result<Self, TransportError> {
        let mut captured = HashMap::with_capacity(regions.len());
        for region in regions {
            let bytes = port.read(region.base, region.len).await?;
            if bytes.len() != region.len as usize {
                return Err(TransportError::Io(format!(
                    "short read of region '{}': {} of {} bytes",
                    region.id,
                    bytes.len(),
                    region.len
                )));
            }
            captured.insert(
                region.id.clone(),
                RegionBytes {
                    base: region.base,
                    bytes,
                },
            );
        }
        Ok(Self { regions: captured })
    }

    /// Build a snapshot from raw region contents.
    pub fn from_regions<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = (S, u32, Vec<u8>)>,
        S: Into<String>,
    {
        Self {
            regions: regions
                .into_iter()
                .map(|(id, base, bytes)| (id.into(), RegionBytes { base, bytes }))
                .collect(),
        }
    }

    /// Raw bytes of one region.
    pub fn region(&self, id: &str) -> Option<&[u8]> {
        self.regions.get(id).map(|r| r.bytes.as_slice())
    }

    /// Bytes at an absolute address, if fully covered by one region.
    pub fn bytes(&self, address: u32, len: u32) -> Option<&[u8]> {
        self.regions.values().find_map(|r| r.slice(address, len))
    }

    /// Single byte at an absolute address.
    pub fn byte(&self, address: u32) -> Option<u8> {
        self.bytes(address, 1).map(|b| b[0])
    }

    /// State of a toggle bit.
    pub fn bit(&self, loc: &BitLocation) -> Option<bool> {
        self.byte(loc.address)
            .map(|b| codec::is_set(b, loc.bit, loc.order))
    }

    /// Value of a counter field.
    pub fn counter(&self, field: &CounterField) -> Option<u64> {
        let bytes = self.bytes(field.address, field.width as u32)?;
        codec::decode_counter(bytes, field.endianness).ok()
    }

    /// Record bytes the bridge wrote successfully.
    ///
    /// Bytes outside every region are ignored.
    pub fn record_write(&mut self, address: u32, bytes: &[u8]) {
        if let Some(dst) = self
            .regions
            .values_mut()
            .find_map(|r| r.slice_mut(address, bytes.len()))
        {
            dst.copy_from_slice(bytes);
        }
    }
}

fn missing(what: &str, address: u32) -> BridgeError {
    BridgeError::Config(format!("{} at {:#010x} is not covered by any region", what, address))
}

/// Port and snapshot bundled for one tick
pub struct TargetMemory<'a, P> {
    port: &'a mut P,
    snapshot: &'a mut MemorySnapshot,
}

impl<'a, P: MemoryPort> TargetMemory<'a, P> {
    /// Bundle `port` with the snapshot taken at the start of this tick.
    pub fn new(port: &'a mut P, snapshot: &'a mut MemorySnapshot) -> Self {
        Self { port, snapshot }
    }

    /// The snapshot, including this tick's own writes.
    pub fn snapshot(&self) -> &MemorySnapshot {
        &*self.snapshot
    }

    /// State of a toggle bit.
    pub fn bit(&self, loc: &BitLocation) -> BridgeResult<bool> {
        self.snapshot
            .bit(loc)
            .ok_or_else(|| missing("toggle", loc.address))
    }

    /// Value of a counter field.
    pub fn counter(&self, field: &CounterField) -> BridgeResult<u64> {
        self.snapshot
            .counter(field)
            .ok_or_else(|| missing("counter", field.address))
    }

    /// Set or clear a single bit.
    ///
    /// The byte is re-read first and only written if the bit actually
    /// changes. Returns whether a write happened.
    pub async fn set_bit(&mut self, loc: &BitLocation, value: bool) -> BridgeResult<bool> {
        let current = self.port.read(loc.address, 1).await?;
        let old = *current.first().ok_or(TransportError::Unmapped {
            address: loc.address,
            len: 1,
        })?;
        let new = if value {
            codec::with_bit_set(old, loc.bit, loc.order)
        } else {
            codec::with_bit_cleared(old, loc.bit, loc.order)
        };

        // keep the snapshot current even when nothing needs writing
        self.snapshot.record_write(loc.address, &[old]);
        if new == old {
            return Ok(false);
        }
        self.port.write(loc.address, &[new]).await?;
        self.snapshot.record_write(loc.address, &[new]);
        Ok(true)
    }

    /// Write a counter if its value differs from the snapshot.
    pub async fn write_counter(&mut self, field: &CounterField, value: u64) -> BridgeResult<bool> {
        let bytes = codec::encode_counter(value, field.width, field.endianness)?;
        if self.snapshot.bytes(field.address, field.width as u32) == Some(bytes.as_slice()) {
            return Ok(false);
        }
        self.port.write(field.address, &bytes).await?;
        self.snapshot.record_write(field.address, &bytes);
        Ok(true)
    }

    /// Write `data` into a byte-array field, truncated or zero padded to the
    /// field length.
    pub async fn write_bytes(&mut self, field: &BytesField, data: &[u8]) -> BridgeResult<bool> {
        let bytes = codec::fit_to_width(data, field.len as usize);
        if self.snapshot.bytes(field.address, field.len) == Some(bytes.as_slice()) {
            return Ok(false);
        }
        self.port.write(field.address, &bytes).await?;
        self.snapshot.record_write(field.address, &bytes);
        Ok(true)
    }
}
