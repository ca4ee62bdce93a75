use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::pipeline::ItemId;

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the session's `events.jsonl`.
///
/// Every line carries `type`, `session_id` and `ts`; pipeline events also
/// carry the `item_id` they describe. Session-level callers may override the
/// defaults through their payload.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emits an event about one item. The item id always wins over a payload key.
    pub fn emit_for_item(
        &self,
        event_type: &str,
        item_id: &ItemId,
        mut payload: EventPayload,
    ) -> anyhow::Result<Value> {
        payload.insert("item_id".to_string(), Value::String(item_id.to_string()));
        self.emit(event_type, payload)
    }
}

/// Reads back an events file, skipping blank and malformed lines.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            events.push(value);
        }
    }
    Ok(events)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), Value::String("modeling".to_string()));
        let emitted = writer.emit("stage_changed", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("stage_changed".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-123".to_string()));
        assert_eq!(parsed["stage"], Value::String("modeling".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn item_events_are_tagged_with_the_item() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");
        let id = ItemId::new();

        let mut payload = EventPayload::new();
        payload.insert("item_id".to_string(), Value::String("stale".to_string()));
        payload.insert("artifact".to_string(), Value::String("mesh".to_string()));
        let emitted = writer.emit_for_item("artifact_set", &id, payload)?;

        assert_eq!(emitted["item_id"], Value::String(id.to_string()));
        assert_eq!(emitted["artifact"], Value::String("mesh".to_string()));
        let events = read_events(&path)?;
        assert_eq!(events, vec![emitted]);
        Ok(())
    }

    #[test]
    fn unwritable_log_path_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        fs::create_dir(&path)?;
        let writer = EventWriter::new(&path, "session-123");

        assert!(writer.emit("session_started", EventPayload::new()).is_err());
        assert!(writer
            .emit_for_item("stage_changed", &ItemId::new(), EventPayload::new())
            .is_err());
        Ok(())
    }

    #[test]
    fn read_events_returns_appended_lines_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        writer.emit("one", EventPayload::new())?;
        writer.emit("two", EventPayload::new())?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"not json\n\n")?;

        let events = read_events(&path)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], Value::String("one".to_string()));
        assert_eq!(events[1]["type"], Value::String("two".to_string()));
        assert!(read_events(&temp.path().join("missing.jsonl"))?.is_empty());
        Ok(())
    }
}
