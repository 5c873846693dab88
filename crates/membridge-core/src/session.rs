//! Session handshake between the bridge and the attached process
//!
//! Before anything is synchronized the bridge confirms that the process it is
//! attached to runs the same session (seed) as the remote multiworld room.
//! Both identifiers are cut or zero padded to the same width and compared
//! byte for byte.
//!
//! ```text
//!            read id field
//! Unverified ─────────────► match ───────────────► Verified
//!      ▲                    │
//!      │ blank / changing   │ same non-blank id N times
//!      └────────────────────┤
//!                           ▼
//!                     SessionMismatch (fatal)
//! ```
//!
//! A blank (all zero) field means the game has not booted far enough to
//! write its id, which is retried silently. A stable, non-blank, different id
//! means the wrong build or seed is running; that is escalated.

use tracing::{debug, info};

use crate::codec;
use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::port::MemoryPort;
use crate::profile::BytesField;

/// Outcome of a single probe of the session id field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProbe {
    /// Whether the normalized identifiers match
    pub matches: bool,
    /// Normalized identifier found in memory
    pub found: Vec<u8>,
}

impl SessionProbe {
    /// Whether the field looks unwritten
    pub fn is_blank(&self) -> bool {
        self.found.iter().all(|&b| b == 0)
    }
}

/// Gate that must pass once before the first synchronized tick
#[derive(Debug, Clone)]
pub struct SessionValidator {
    field: BytesField,
    width: usize,
    confirmations: u32,
    verified: bool,
    last_mismatch: Option<Vec<u8>>,
    mismatch_count: u32,
}

impl SessionValidator {
    /// Create a validator for `field`, comparing at most `width` bytes.
    ///
    /// A stable mismatch must be seen `confirmations` times in a row before
    /// it is reported as fatal.
    pub fn new(field: BytesField, width: usize, confirmations: u32) -> Self {
        Self {
            field,
            width: width.min(field.len as usize).max(1),
            confirmations: confirmations.max(1),
            verified: false,
            last_mismatch: None,
            mismatch_count: 0,
        }
    }

    /// Number of bytes compared
    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether the gate has passed since the last reset
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Forget a previous success; called after the transport disconnects.
    pub fn reset(&mut self) {
        self.verified = false;
        self.last_mismatch = None;
        self.mismatch_count = 0;
    }

    /// Normalize an identifier to the compared width.
    pub fn normalize(&self, id: &[u8]) -> Vec<u8> {
        codec::fit_to_width(id, self.width)
    }

    /// Read the id field and compare it with `expected`.
    pub async fn probe<P: MemoryPort>(
        &self,
        port: &mut P,
        expected: &[u8],
    ) -> Result<SessionProbe, TransportError> {
        let raw = port.read(self.field.address, self.field.len).await?;
        let found = self.normalize(&raw);
        Ok(SessionProbe {
            matches: found == self.normalize(expected),
            found,
        })
    }

    /// Verify the attached process against `expected`.
    ///
    /// Returns `Ok(false)` on any mismatch so the caller can wait and retry;
    /// only genuine I/O failures are errors.
    pub async fn verify<P: MemoryPort>(
        &mut self,
        port: &mut P,
        expected: &[u8],
    ) -> Result<bool, TransportError> {
        let probe = self.probe(port, expected).await?;
        if probe.matches {
            self.verified = true;
        }
        Ok(probe.matches)
    }

    /// Gate used by the tick: like [`verify`](Self::verify), but a stable
    /// non-blank mismatch becomes [`BridgeError::SessionMismatch`].
    pub async fn check<P: MemoryPort>(
        &mut self,
        port: &mut P,
        expected: &[u8],
    ) -> BridgeResult<bool> {
        if self.verified {
            return Ok(true);
        }

        let probe = self.probe(port, expected).await?;
        if probe.matches {
            info!(session = %hex::encode(&probe.found), "Session verified");
            self.verified = true;
            self.last_mismatch = None;
            self.mismatch_count = 0;
            return Ok(true);
        }

        if probe.is_blank() {
            debug!("Session id not written yet, waiting");
            self.last_mismatch = None;
            self.mismatch_count = 0;
            return Ok(false);
        }

        if self.last_mismatch.as_ref() == Some(&probe.found) {
            self.mismatch_count += 1;
        } else {
            self.last_mismatch = Some(probe.found.clone());
            self.mismatch_count = 1;
        }
        debug!(
            found = %hex::encode(&probe.found),
            count = self.mismatch_count,
            "Session id mismatch"
        );

        if self.mismatch_count >= self.confirmations {
            return Err(BridgeError::SessionMismatch {
                expected: hex::encode(self.normalize(expected)),
                found: hex::encode(&probe.found),
            });
        }
        Ok(false)
    }
}
