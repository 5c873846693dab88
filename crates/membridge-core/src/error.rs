//! Error types for the memory bridge

use thiserror::Error;

/// Failure of a single operation against the foreign process.
///
/// Transport errors are always transient from the bridge's point of view:
/// the tick is aborted, the port is marked disconnected and the loop
/// re-attaches with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The foreign process went away (emulator closed, core unloaded)
    #[error("Process detached")]
    Detached,

    /// The requested range is not mapped in the foreign address space
    #[error("Address range not mapped: {address:#010x}+{len}")]
    Unmapped {
        /// First byte of the requested range
        address: u32,
        /// Length of the requested range
        len: u32,
    },

    /// The emulator did not answer in time
    #[error("Transport timeout")]
    Timeout,

    /// Any other I/O failure reported by the emulator integration
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Problems with a game profile (the region/offset table).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// Profile declares a format version this build does not understand
    #[error("Unsupported profile version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build understands
        expected: u32,
        /// Version found in the profile
        found: u32,
    },

    /// A flag or layout field refers to a region that is not defined
    #[error("Unknown region '{region}' referenced by '{field}'")]
    UnknownRegion {
        /// The missing region id
        region: String,
        /// The flag or layout field that referenced it
        field: String,
    },

    /// A flag or layout field lies (partially) outside its region
    #[error("'{field}' is out of range for region '{region}'")]
    OutOfRange {
        /// The offending flag or layout field
        field: String,
        /// Region the field was resolved against
        region: String,
    },

    /// Counter widths are limited to 1..=8 bytes
    #[error("Invalid counter width {width} for '{field}'")]
    InvalidWidth {
        /// The offending flag or layout field
        field: String,
        /// The declared width
        width: u32,
    },

    /// A layout field refers to a flag id that is not defined
    #[error("Unknown flag '{0}'")]
    UnknownFlag(String),

    /// A flag has the wrong storage kind for where it is used
    #[error("Flag '{flag}' must be a {expected}")]
    WrongKind {
        /// The offending flag
        flag: String,
        /// The storage kind the usage site needs
        expected: &'static str,
    },

    /// Two definitions share one id
    #[error("Duplicate id '{0}'")]
    Duplicate(String),
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Memory I/O against the target process failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The attached process runs a different session than the remote one
    #[error("Session mismatch: expected {expected}, found {found}")]
    SessionMismatch {
        /// Session id announced by the remote session (hex)
        expected: String,
        /// Session id found in the target process (hex)
        found: String,
    },

    /// Invalid profile or configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Profile validation failure
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Value could not be encoded into its configured width
    #[error("Value {value} does not fit in {width} byte(s)")]
    Overflow {
        /// The value that was encoded
        value: u64,
        /// The target width in bytes
        width: usize,
    },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Both ends of the remote session link were dropped
    #[error("Remote session link closed")]
    SessionClosed,

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the loop should treat this error as a lost connection to the
    /// target process (abort the tick, reconnect) rather than escalate it.
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport(_))
    }

    /// Whether this error must stop the bridge and be shown to the user.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SessionMismatch { .. }
                | BridgeError::Config(_)
                | BridgeError::Profile(_)
                | BridgeError::SessionClosed
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Unmapped {
            address: 0x1000,
            len: 4,
        };
        assert_eq!(format!("{}", err), "Address range not mapped: 0x00001000+4");

        let err = BridgeError::SessionMismatch {
            expected: "abcd".to_string(),
            found: "0102".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Session mismatch: expected abcd, found 0102"
        );
    }

    #[test]
    fn test_error_from_transport() {
        let err: BridgeError = TransportError::Detached.into();
        assert!(err.is_transport());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_session_mismatch_is_fatal() {
        let err = BridgeError::SessionMismatch {
            expected: String::new(),
            found: String::new(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
