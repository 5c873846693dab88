//! Structured JSONL logging for bridge runs.
//!
//! Every bridge instance appends to its own file, so several bridges (one
//! per emulator) can log into the same directory without coordination.
//!
//! ```ignore
//! use membridge_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let jsonl = JsonlLayer::new("./logs", "snes")?;
//! tracing_subscriber::registry()
//!     .with(jsonl)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! Querying with jq:
//!
//! ```bash
//! # everything the bridge could not deliver
//! jq 'select(.level == "warn")' logs/raw/*.jsonl
//!
//! # one instance, in order
//! jq 'select(.instance == "snes")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::{BridgeLogEntry, RunMetadata};
pub use layer::JsonlLayer;
pub use writer::{read_entries, write_run_metadata, LogFileWriter};
