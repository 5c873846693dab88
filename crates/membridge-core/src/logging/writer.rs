//! Append-only JSONL files.
//!
//! ```text
//! <log_dir>/
//! ├── raw/
//! │   └── 2026-10-19_snes.jsonl      # one file per instance per day
//! └── sessions/
//!     └── 2026-10-19T14-13-48.json   # RunMetadata of each run
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::{BridgeLogEntry, RunMetadata};

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Appends entries to the instance's file for today
pub struct LogFileWriter {
    instance: String,
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl LogFileWriter {
    /// Open (or create) `<log_dir>/raw/<date>_<instance>.jsonl`.
    pub fn open(log_dir: impl AsRef<Path>, instance: impl Into<String>) -> io::Result<Self> {
        let instance = instance.into();
        let raw = log_dir.as_ref().join("raw");
        fs::create_dir_all(&raw)?;

        let path = raw.join(format!(
            "{}_{}.jsonl",
            chrono::Local::now().format("%Y-%m-%d"),
            instance
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Instance name
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush, so a crash loses at most this line.
    pub fn append(&self, entry: &BridgeLogEntry) -> io::Result<()> {
        let line = entry.to_json_line().map_err(invalid_data)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

impl Drop for LogFileWriter {
    fn drop(&mut self) {
        let _ = self.file.lock().flush();
    }
}

/// Write `meta` to `<log_dir>/sessions/<run_id>.json`.
pub fn write_run_metadata(log_dir: impl AsRef<Path>, meta: &RunMetadata) -> io::Result<PathBuf> {
    let dir = log_dir.as_ref().join("sessions");
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", meta.run_id));
    fs::write(&path, serde_json::to_string_pretty(meta).map_err(invalid_data)?)?;
    Ok(path)
}

/// Every parseable entry under `<log_dir>/raw`, ordered by timestamp.
///
/// Lines that fail to parse (a torn last line after a crash) are skipped.
pub fn read_entries(log_dir: impl AsRef<Path>) -> io::Result<Vec<BridgeLogEntry>> {
    let raw = log_dir.as_ref().join("raw");
    if !raw.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(&raw)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        entries.extend(
            fs::read_to_string(&path)?
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| BridgeLogEntry::from_json_line(line).ok()),
        );
    }
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
