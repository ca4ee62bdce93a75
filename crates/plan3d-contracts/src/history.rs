use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::assets::AssetRef;
use crate::errors::ActionRejected;
use crate::jobs::{JobSnapshot, JobStatus};
use crate::pipeline::{ArtifactKind, ImageItem, ItemOrigin, PipelineStage};

/// One job from the vendor's task listing.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub task_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub mesh: Option<AssetRef>,
    pub thumbnail: Option<String>,
    pub source_image: Option<AssetRef>,
    pub prompt: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn from_value(row: &Value) -> Option<Self> {
        let task_id = non_empty_str(row, "id").or_else(|| non_empty_str(row, "task_id"))?;
        let snapshot = JobSnapshot::from_value(row);
        let (status, progress, mesh, thumbnail) = match snapshot {
            Some(snapshot) => (
                snapshot.status,
                snapshot.progress,
                snapshot.mesh,
                snapshot.thumbnail,
            ),
            None => (JobStatus::Other("unknown".to_string()), 0, None, None),
        };
        Some(Self {
            task_id,
            status,
            progress,
            mesh,
            thumbnail,
            source_image: non_empty_str(row, "image_url").map(|url| AssetRef::classify(&url)),
            prompt: non_empty_str(row, "texture_prompt").or_else(|| non_empty_str(row, "prompt")),
            created_at: row.get("created_at").and_then(parse_timestamp),
        })
    }

    pub fn is_openable(&self) -> bool {
        self.status == JobStatus::Succeeded && self.mesh.is_some()
    }

    /// Rebuilds a finished item; entries without a mesh cannot be opened.
    pub fn into_item(self) -> Result<ImageItem, ActionRejected> {
        let mesh = match self.mesh.clone() {
            Some(mesh) if self.is_openable() => mesh,
            _ => {
                return Err(ActionRejected::HistoryIncomplete {
                    task_id: self.task_id,
                    status: self.status.to_string(),
                })
            }
        };
        let mut item = ImageItem::with_source(self.source_image.clone());
        item.uploaded = self.source_image.filter(AssetRef::is_transferable);
        item.artifacts.set(ArtifactKind::Mesh, mesh);
        item.stage = PipelineStage::Complete;
        item.generation.texture_prompt = self.prompt;
        item.push_log(format!("Loaded from history task {}", self.task_id));
        item.origin = ItemOrigin::History {
            task_id: self.task_id,
        };
        Ok(item)
    }

    pub fn summary_line(&self) -> String {
        let created = self
            .created_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let prompt = self.prompt.as_deref().unwrap_or("");
        let mut line = format!("{}  {:<11}  {created}", self.task_id, self.status.as_str());
        if !prompt.is_empty() {
            line.push_str("  ");
            line.push_str(&truncate_chars(prompt, 48));
        }
        line
    }
}

/// Accepts a bare array, `{result: [...]}`, `{data: [...]}` or a single job object.
/// Returns entries newest first, at most `limit`.
pub fn parse_history(payload: &Value, limit: usize) -> Vec<HistoryEntry> {
    let rows: Vec<&Value> = match payload {
        Value::Array(rows) => rows.iter().collect(),
        Value::Object(obj) => match obj
            .get("result")
            .or_else(|| obj.get("data"))
            .and_then(Value::as_array)
        {
            Some(rows) => rows.iter().collect(),
            None => vec![payload],
        },
        _ => Vec::new(),
    };
    let mut entries: Vec<HistoryEntry> = rows
        .into_iter()
        .filter_map(HistoryEntry::from_value)
        .collect();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries.truncate(limit);
    entries
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => {
            let millis = number.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        _ => None,
    }
}

fn non_empty_str(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn listing() -> Value {
        json!({
            "result": [
                {
                    "id": "old",
                    "status": "SUCCEEDED",
                    "progress": 100,
                    "created_at": 1_700_000_000_000i64,
                    "model_urls": {"glb": "https://assets.meshy.ai/old.glb"},
                    "image_url": "https://x/old.png"
                },
                {
                    "id": "new",
                    "status": "FAILED",
                    "created_at": 1_700_000_900_000i64,
                    "task_error": {"message": "bad input"}
                },
                {
                    "id": "mid",
                    "status": "SUCCEEDED",
                    "created_at": "2023-11-14T22:20:00Z",
                    "model_urls": {"glb": "https://assets.meshy.ai/mid.glb"},
                    "texture_prompt": "oak floors"
                },
                {"status": "SUCCEEDED"}
            ]
        })
    }

    #[test]
    fn listing_is_sorted_newest_first_and_truncated() {
        let entries = parse_history(&listing(), 2);
        let ids: Vec<&str> = entries.iter().map(|entry| entry.task_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        assert_eq!(entries[1].prompt.as_deref(), Some("oak floors"));
    }

    #[test]
    fn bare_array_and_single_object_are_accepted() {
        let array = json!([{"id": "a", "status": "PENDING"}]);
        assert_eq!(parse_history(&array, 10).len(), 1);
        let single = json!({"id": "b", "status": "IN_PROGRESS", "progress": 40});
        let entries = parse_history(&single, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, JobStatus::InProgress);
        assert_eq!(entries[0].progress, 40);
    }

    #[test]
    fn succeeded_entry_becomes_complete_item_with_mesh() -> anyhow::Result<()> {
        let entry = parse_history(&listing(), 10)
            .into_iter()
            .find(|entry| entry.task_id == "old")
            .ok_or_else(|| anyhow::anyhow!("missing entry"))?;
        assert!(entry.is_openable());

        let item = entry.into_item()?;
        assert_eq!(item.stage, PipelineStage::Complete);
        assert_eq!(
            item.artifact(ArtifactKind::Mesh),
            Some(&AssetRef::remote("https://assets.meshy.ai/old.glb"))
        );
        assert_eq!(item.source, Some(AssetRef::remote("https://x/old.png")));
        assert_eq!(
            item.origin,
            ItemOrigin::History {
                task_id: "old".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn entry_without_image_url_has_no_source() -> anyhow::Result<()> {
        let entry = parse_history(&listing(), 10)
            .into_iter()
            .find(|entry| entry.task_id == "mid")
            .ok_or_else(|| anyhow::anyhow!("missing entry"))?;
        let item = entry.into_item()?;
        assert_eq!(item.source, None);
        assert_eq!(item.uploaded, None);
        assert_eq!(item.input_image(), None);
        assert_eq!(
            item.artifact(ArtifactKind::Mesh),
            Some(&AssetRef::remote("https://assets.meshy.ai/mid.glb"))
        );
        Ok(())
    }

    #[test]
    fn entry_without_mesh_is_rejected() {
        let entry = parse_history(&listing(), 10)
            .into_iter()
            .find(|entry| entry.task_id == "new");
        let rejected = entry.map(HistoryEntry::into_item);
        assert_eq!(
            rejected,
            Some(Err(ActionRejected::HistoryIncomplete {
                task_id: "new".to_string(),
                status: "FAILED".to_string()
            }))
        );
    }

    #[test]
    fn summary_line_shows_status_and_prompt() {
        let entry = HistoryEntry {
            task_id: "t-1".to_string(),
            status: JobStatus::Succeeded,
            progress: 100,
            mesh: None,
            thumbnail: None,
            source_image: None,
            prompt: Some("bright scandinavian living room with oak floors and big windows".to_string()),
            created_at: None,
        };
        let line = entry.summary_line();
        assert!(line.starts_with("t-1  SUCCEEDED"));
        assert!(line.ends_with("..."));
    }
}
