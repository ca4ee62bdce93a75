use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assets::AssetRef;
use crate::services::extract::extract_result;

/// Identifier of a vendor-side asynchronous job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Expired,
    Canceled,
    Other(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" | "STARTING" => Self::Pending,
            "IN_PROGRESS" | "PROCESSING" | "RUNNING" => Self::InProgress,
            "SUCCEEDED" | "SUCCESS" | "COMPLETED" => Self::Succeeded,
            "FAILED" | "ERROR" => Self::Failed,
            "EXPIRED" => Self::Expired,
            "CANCELED" | "CANCELLED" => Self::Canceled,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Canceled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of a job's status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub raw_status: String,
    pub progress: u8,
    pub mesh: Option<AssetRef>,
    pub thumbnail: Option<String>,
    pub error_detail: Option<String>,
}

impl JobSnapshot {
    pub fn pending(progress: u8) -> Self {
        Self {
            status: JobStatus::Pending,
            raw_status: "PENDING".to_string(),
            progress: progress.min(100),
            mesh: None,
            thumbnail: None,
            error_detail: None,
        }
    }

    pub fn succeeded(mesh: Option<AssetRef>) -> Self {
        Self {
            status: JobStatus::Succeeded,
            raw_status: "SUCCEEDED".to_string(),
            progress: 100,
            mesh,
            thumbnail: None,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            raw_status: "FAILED".to_string(),
            progress: 0,
            mesh: None,
            thumbnail: None,
            error_detail: Some(detail.into()),
        }
    }

    /// Parses a status payload; `None` when it has no `status` field at all.
    pub fn from_value(payload: &Value) -> Option<Self> {
        let raw_status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())?
            .to_string();
        let progress = payload
            .get("progress")
            .and_then(|value| value.as_f64())
            .map(|value| value.clamp(0.0, 100.0).round() as u8)
            .unwrap_or(0);
        let mesh = extract_result(payload).map(|(_, asset)| asset);
        let thumbnail = payload
            .get("thumbnail_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let error_detail = payload
            .get("task_error")
            .and_then(|error| error.get("message"))
            .or_else(|| payload.get("error"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Some(Self {
            status: JobStatus::parse(&raw_status),
            raw_status,
            progress,
            mesh,
            thumbnail,
            error_detail,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    pub job_id: JobId,
    pub mesh: AssetRef,
    pub thumbnail: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_parsing_accepts_vendor_spellings() {
        assert_eq!(JobStatus::parse("in_progress"), JobStatus::InProgress);
        assert_eq!(JobStatus::parse(" SUCCEEDED "), JobStatus::Succeeded);
        assert_eq!(JobStatus::parse("cancelled"), JobStatus::Canceled);
        assert_eq!(
            JobStatus::parse("WARMING_UP"),
            JobStatus::Other("WARMING_UP".to_string())
        );
        assert!(JobStatus::Expired.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Other("x".to_string()).is_terminal());
    }

    #[test]
    fn snapshot_reads_meshy_task_payload() {
        let snapshot = JobSnapshot::from_value(&json!({
            "id": "018a",
            "status": "SUCCEEDED",
            "progress": 100,
            "model_urls": {"glb": "https://assets.meshy.ai/t/model.glb"},
            "thumbnail_url": "https://assets.meshy.ai/t/preview.png",
            "task_error": {"message": ""}
        }))
        .unwrap_or_else(|| JobSnapshot::pending(0));

        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(
            snapshot.mesh,
            Some(AssetRef::remote("https://assets.meshy.ai/t/model.glb"))
        );
        assert_eq!(
            snapshot.thumbnail.as_deref(),
            Some("https://assets.meshy.ai/t/preview.png")
        );
        assert_eq!(snapshot.error_detail, None);
    }

    #[test]
    fn snapshot_keeps_failure_detail() {
        let snapshot = JobSnapshot::from_value(&json!({
            "status": "FAILED",
            "progress": 37.6,
            "task_error": {"message": "oom"}
        }))
        .unwrap_or_else(|| JobSnapshot::pending(0));
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.progress, 38);
        assert_eq!(snapshot.error_detail.as_deref(), Some("oom"));
    }

    #[test]
    fn snapshot_requires_status_field() {
        assert!(JobSnapshot::from_value(&json!({"progress": 10})).is_none());
        assert!(JobSnapshot::from_value(&json!({"status": "  "})).is_none());
    }
}
