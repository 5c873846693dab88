//! Records stored in the JSONL log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BridgeConfig;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// One line of a bridge log file.
///
/// Lines are self-contained, so a file can be appended to, truncated by a
/// crash, or concatenated with another bridge's log without breaking
/// parsing of the remaining lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    /// trace, debug, info, warn or error
    pub level: String,
    /// Bridge instance that wrote the line
    pub instance: String,
    /// tracing target, usually the module path
    pub target: String,
    /// Event message
    pub msg: String,
    /// Structured fields of the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

impl BridgeLogEntry {
    /// Entry stamped with the current time.
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: now_rfc3339(),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
        }
    }

    /// Attach structured fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Value of one structured field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref()?.get(name)
    }

    /// Single JSON line without the trailing newline.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON line.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Description of one bridge run, written next to the raw logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run id derived from the start time
    pub run_id: String,
    /// RFC 3339 start time
    pub started_at: String,
    /// Bridge instance name
    pub instance: String,
    /// Game of the loaded profile
    pub game: String,
    /// Profile file, if loaded from disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_path: Option<String>,
    /// Effective configuration
    pub config: BridgeConfig,
    /// Version of the bridge
    pub version: String,
}

impl RunMetadata {
    /// Metadata for a run starting now.
    pub fn new(instance: impl Into<String>, game: impl Into<String>, config: BridgeConfig) -> Self {
        let now = chrono::Utc::now();
        Self {
            run_id: now.format("%Y-%m-%dT%H-%M-%S").to_string(),
            started_at: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            instance: instance.into(),
            game: game.into(),
            profile_path: None,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Record where the profile came from.
    pub fn with_profile_path(mut self, path: impl Into<String>) -> Self {
        self.profile_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_json_line() {
        let entry = BridgeLogEntry::new("info", "snes", "membridge_core::bridge", "Goal completed")
            .with_fields(serde_json::json!({ "slot": 3 }));

        let line = entry.to_json_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""instance":"snes""#));

        let parsed = BridgeLogEntry::from_json_line(&line).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.field("slot"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_entry_without_fields_omits_key() {
        let line = BridgeLogEntry::new("warn", "a", "t", "m").to_json_line().unwrap();
        assert!(!line.contains("fields"));
    }

    #[test]
    fn test_run_metadata() {
        let meta = RunMetadata::new("snes", "Test Game", BridgeConfig::default())
            .with_profile_path("profiles/demo.json");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""game":"Test Game""#));
        assert!(json.contains(r#""tick_interval_ms":250"#));
        assert_eq!(meta.profile_path.as_deref(), Some("profiles/demo.json"));
    }
}
