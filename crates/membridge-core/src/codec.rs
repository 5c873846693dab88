//! Bit and counter codec
//!
//! Pure translation between symbolic flag positions and concrete
//! `(address, bit)` / `(address, width)` pairs. Nothing here performs I/O or
//! holds state; every function returns new values so callers can compare old
//! and new bytes and only write when something actually changed.
//!
//! ```text
//! region base 0x1000, toggle index 19
//!
//!   byte  = 0x1000 + 19 / 8 = 0x1002
//!   bit   = 19 % 8          = 3
//!   mask  = 0b0000_1000     (Lsb0)
//!           0b0001_0000     (Msb0)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Largest counter width (in bytes) the codec supports
pub const MAX_COUNTER_WIDTH: usize = 8;

/// Byte order of multi-byte counters within a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

/// Bit numbering within a byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitOrder {
    /// Bit 0 is the least significant bit (mask `1 << bit`)
    #[default]
    Lsb0,
    /// Bit 0 is the most significant bit (mask `0x80 >> bit`)
    Msb0,
}

/// Concrete position of a single toggle bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitLocation {
    /// Absolute byte address in the foreign process
    pub address: u32,
    /// Bit number within that byte (0..8), interpreted per `order`
    pub bit: u8,
    /// Bit numbering of the owning region
    pub order: BitOrder,
}

impl BitLocation {
    /// Mask selecting this bit within its byte
    pub fn mask(&self) -> u8 {
        bit_mask(self.bit, self.order)
    }
}

/// Locate a toggle flag: `base + index / 8`, bit `index % 8`.
pub fn locate(index: u32, base: u32, order: BitOrder) -> BitLocation {
    BitLocation {
        address: base.wrapping_add(index / 8),
        bit: (index % 8) as u8,
        order,
    }
}

/// Mask for `bit` under the given bit numbering.
pub fn bit_mask(bit: u8, order: BitOrder) -> u8 {
    debug_assert!(bit < 8);
    match order {
        BitOrder::Lsb0 => 1u8 << bit,
        BitOrder::Msb0 => 0x80u8 >> bit,
    }
}

/// Check whether `bit` is set in `byte`.
pub fn is_set(byte: u8, bit: u8, order: BitOrder) -> bool {
    byte & bit_mask(bit, order) != 0
}

/// Return `byte` with `bit` set; the input is left untouched.
pub fn with_bit_set(byte: u8, bit: u8, order: BitOrder) -> u8 {
    byte | bit_mask(bit, order)
}

/// Return `byte` with `bit` cleared; the input is left untouched.
pub fn with_bit_cleared(byte: u8, bit: u8, order: BitOrder) -> u8 {
    byte & !bit_mask(bit, order)
}

/// Largest value representable in `width` bytes.
pub fn max_value(width: usize) -> u64 {
    if width >= MAX_COUNTER_WIDTH {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn check_width(width: usize) -> BridgeResult<()> {
    if width == 0 || width > MAX_COUNTER_WIDTH {
        return Err(BridgeError::Config(format!(
            "counter width must be 1..={} bytes, got {}",
            MAX_COUNTER_WIDTH, width
        )));
    }
    Ok(())
}

/// Decode an unsigned counter from `bytes` (width = `bytes.len()`).
pub fn decode_counter(bytes: &[u8], endianness: Endianness) -> BridgeResult<u64> {
    check_width(bytes.len())?;

    let value = match endianness {
        Endianness::Little => bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        Endianness::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    };
    Ok(value)
}

/// Encode `value` into exactly `width` bytes.
///
/// Fails with [`BridgeError::Overflow`] if the value does not fit; counters
/// are never silently truncated.
pub fn encode_counter(value: u64, width: usize, endianness: Endianness) -> BridgeResult<Vec<u8>> {
    check_width(width)?;
    if value > max_value(width) {
        return Err(BridgeError::Overflow { value, width });
    }

    let le = value.to_le_bytes();
    let mut bytes = le[..width].to_vec();
    if endianness == Endianness::Big {
        bytes.reverse();
    }
    Ok(bytes)
}

/// Pad or truncate `bytes` to exactly `width` bytes (zero padding).
///
/// Used wherever two identifiers of possibly different lengths must be
/// compared byte for byte.
pub fn fit_to_width(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = bytes[..bytes.len().min(width)].to_vec();
    out.resize(width, 0);
    out
}
