//! `tracing` layer that mirrors events into the JSONL log.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::entry::BridgeLogEntry;
use super::writer::LogFileWriter;

/// Writes every event that passes the subscriber's filter as one JSON line.
///
/// Cloning shares the underlying file.
#[derive(Clone)]
pub struct JsonlLayer {
    writer: Arc<LogFileWriter>,
}

impl JsonlLayer {
    /// Log into `<log_dir>/raw/<date>_<instance>.jsonl`.
    pub fn new(log_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(LogFileWriter::open(log_dir, instance)?),
        })
    }

    /// Path of the log file
    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }
}

impl<S: Subscriber> Layer<S> for JsonlLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut entry = BridgeLogEntry::new(
            meta.level().as_str().to_lowercase(),
            self.writer.instance(),
            meta.target(),
            fields.message.unwrap_or_default(),
        );
        if !fields.values.is_empty() {
            entry = entry.with_fields(Value::Object(fields.values));
        }

        // a failing log write must never take the bridge down
        let _ = self.writer.append(&entry);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        self.values.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut text = String::new();
        let _ = write!(text, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.put(field, Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}
