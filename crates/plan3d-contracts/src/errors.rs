use thiserror::Error;

use crate::jobs::JobId;
use crate::pipeline::{ArtifactKind, ItemId, PipelineAction, PipelineStage};
use crate::services::ServiceKind;

/// A single vendor call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("{service} response carried no usable result field")]
    NoResultField { service: ServiceKind },
    #[error("{service} request failed ({status}): {body}")]
    Http {
        service: ServiceKind,
        status: u16,
        body: String,
    },
    #[error("{service} transport failed: {detail}")]
    Network { service: ServiceKind, detail: String },
    #[error("{service} is not configured: {detail}")]
    NotConfigured { service: ServiceKind, detail: String },
    #[error("{service} input rejected: {detail}")]
    InvalidInput { service: ServiceKind, detail: String },
}

impl ServiceError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoResultField { .. } => "no-result-field",
            Self::Http { .. } => "http-error",
            Self::Network { .. } => "network",
            Self::NotConfigured { .. } => "not-configured",
            Self::InvalidInput { .. } => "invalid-input",
        }
    }
}

/// An asynchronous job ended without a usable mesh.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("job {job_id} succeeded without a model URL")]
    NoModelUrl { job_id: JobId },
    #[error("job {job_id} {status}: {detail}")]
    JobFailed {
        job_id: JobId,
        status: String,
        detail: String,
    },
    #[error("polling job {job_id} failed: {source}")]
    PollTransport {
        job_id: JobId,
        #[source]
        source: ServiceError,
    },
    #[error("job {job_id} still running after {elapsed_s:.1}s ({attempts} polls)")]
    Timeout {
        job_id: JobId,
        attempts: u32,
        elapsed_s: f64,
    },
    #[error("polling job {job_id} was canceled")]
    Canceled { job_id: JobId },
}

impl JobError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoModelUrl { .. } => "no-model-url",
            Self::JobFailed { .. } => "job-failed",
            Self::PollTransport { .. } => "poll-transport-error",
            Self::Timeout { .. } => "timeout",
            Self::Canceled { .. } => "canceled",
        }
    }

    /// Vendor-supplied failure detail, when there is one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::JobFailed { detail, .. } => Some(detail.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no renderer is mounted; view capture unavailable")]
pub struct CaptureUnavailable;

/// Precondition failures for user actions. Nothing is mutated when these are returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionRejected {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("item {item} is busy ({stage})")]
    Busy { item: ItemId, stage: PipelineStage },
    #[error("cannot {action} while {stage}")]
    InvalidStage {
        action: PipelineAction,
        stage: PipelineStage,
    },
    #[error("{action} needs a {missing} artifact")]
    MissingArtifact {
        action: PipelineAction,
        missing: ArtifactKind,
    },
    #[error("{action} needs a source image")]
    MissingSource { action: PipelineAction },
    #[error("item {0} has no failed action to retry")]
    NothingToRetry(ItemId),
    #[error("history entry {task_id} has no finished mesh ({status})")]
    HistoryIncomplete { task_id: String, status: String },
    #[error("{0}")]
    InvalidOption(String),
}

impl ActionRejected {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownItem(_) => "unknown-item",
            Self::Busy { .. } => "busy",
            Self::InvalidStage { .. } => "invalid-stage",
            Self::MissingArtifact { .. } => "missing-artifact",
            Self::MissingSource { .. } => "missing-source",
            Self::NothingToRetry(_) => "nothing-to-retry",
            Self::HistoryIncomplete { .. } => "history-incomplete",
            Self::InvalidOption(_) => "invalid-option",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    ItemRemoved,
    Superseded,
    StageMoved,
    NotApplicable,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ItemRemoved => "item removed",
            Self::Superseded => "superseded by a newer action",
            Self::StageMoved => "item moved to another stage",
            Self::NotApplicable => "update does not apply to this stage",
        }
    }
}

/// An asynchronous result arrived for an item that no longer expects it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ignored update for item {item_id}: {}", .reason.as_str())]
pub struct UpdateIgnored {
    pub item_id: ItemId,
    pub reason: IgnoreReason,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Capture(#[from] CaptureUnavailable),
    #[error(transparent)]
    Rejected(#[from] ActionRejected),
    #[error("event log write failed: {0}")]
    EventLog(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::EventLog(format!("{err:#}"))
    }
}

impl PipelineError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Service(err) => err.reason(),
            Self::Job(err) => err.reason(),
            Self::Capture(_) => "capture-unavailable",
            Self::Rejected(err) => err.reason(),
            Self::EventLog(_) => "event-log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_use_wire_names() {
        let service = ServiceError::NoResultField {
            service: ServiceKind::Depth,
        };
        assert_eq!(service.reason(), "no-result-field");
        assert_eq!(
            service.to_string(),
            "depth response carried no usable result field"
        );

        let job = JobError::JobFailed {
            job_id: JobId::new("t-1"),
            status: "FAILED".to_string(),
            detail: "oom".to_string(),
        };
        assert_eq!(job.reason(), "job-failed");
        assert_eq!(job.detail(), Some("oom"));
        assert_eq!(PipelineError::from(job).reason(), "job-failed");
        assert_eq!(
            PipelineError::from(CaptureUnavailable).reason(),
            "capture-unavailable"
        );
    }

    #[test]
    fn poll_transport_keeps_source_chain() {
        let err = JobError::PollTransport {
            job_id: JobId::new("t-9"),
            source: ServiceError::Network {
                service: ServiceKind::MeshGeneration,
                detail: "connection reset".to_string(),
            },
        };
        assert_eq!(err.reason(), "poll-transport-error");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("mesh-generation transport failed: connection reset")
        );
    }
}
