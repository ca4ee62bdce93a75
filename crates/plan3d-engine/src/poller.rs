use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use plan3d_contracts::errors::{JobError, ServiceError};
use plan3d_contracts::jobs::{JobId, JobSnapshot, JobStatus, TerminalResult};

use crate::config::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_S};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Anything that can report the current status of a submitted job.
pub trait JobStatusSource: Send + Sync {
    fn fetch_status(&self, job_id: &JobId) -> Result<JobSnapshot, ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: None,
            max_duration: Some(Duration::from_secs(DEFAULT_POLL_TIMEOUT_S)),
        }
    }
}

/// Shared flag that stops a poll loop. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Polls `job_id` at a fixed interval until it reaches a terminal status.
///
/// `on_update(progress, raw_status)` fires once per non-terminal observation and
/// never after the loop has decided its outcome. A canceled loop returns
/// [`JobError::Canceled`] without invoking the callback again.
pub fn poll_until_terminal(
    source: &dyn JobStatusSource,
    job_id: &JobId,
    policy: &PollPolicy,
    cancel: &CancelToken,
    mut on_update: impl FnMut(u8, &str),
) -> Result<TerminalResult, JobError> {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let canceled = || JobError::Canceled {
        job_id: job_id.clone(),
    };

    loop {
        if cancel.is_canceled() {
            return Err(canceled());
        }
        attempts += 1;
        let snapshot = source
            .fetch_status(job_id)
            .map_err(|source| JobError::PollTransport {
                job_id: job_id.clone(),
                source,
            })?;
        if cancel.is_canceled() {
            return Err(canceled());
        }

        match snapshot.status {
            JobStatus::Succeeded => {
                let Some(mesh) = snapshot.mesh else {
                    return Err(JobError::NoModelUrl {
                        job_id: job_id.clone(),
                    });
                };
                return Ok(TerminalResult {
                    job_id: job_id.clone(),
                    mesh,
                    thumbnail: snapshot.thumbnail,
                });
            }
            JobStatus::Failed | JobStatus::Expired | JobStatus::Canceled => {
                let detail = snapshot
                    .error_detail
                    .unwrap_or_else(|| snapshot.raw_status.clone());
                return Err(JobError::JobFailed {
                    job_id: job_id.clone(),
                    status: snapshot.raw_status,
                    detail,
                });
            }
            JobStatus::Pending | JobStatus::InProgress | JobStatus::Other(_) => {
                on_update(snapshot.progress, &snapshot.raw_status);
            }
        }

        let elapsed = started.elapsed();
        let out_of_attempts = policy.max_attempts.is_some_and(|max| attempts >= max);
        let out_of_time = policy.max_duration.is_some_and(|max| elapsed >= max);
        if out_of_attempts || out_of_time {
            return Err(JobError::Timeout {
                job_id: job_id.clone(),
                attempts,
                elapsed_s: elapsed.as_secs_f64(),
            });
        }

        sleep_unless_canceled(policy.interval, cancel);
        if cancel.is_canceled() {
            return Err(canceled());
        }
    }
}

fn sleep_unless_canceled(total: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_canceled() {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use plan3d_contracts::assets::AssetRef;
    use plan3d_contracts::services::ServiceKind;

    use super::*;

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<JobSnapshot, ServiceError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<JobSnapshot, ServiceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.lock().map(|calls| *calls).unwrap_or(0)
        }
    }

    impl JobStatusSource for ScriptedSource {
        fn fetch_status(&self, _job_id: &JobId) -> Result<JobSnapshot, ServiceError> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls += 1;
            }
            self.responses
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front())
                .unwrap_or_else(|| Ok(JobSnapshot::pending(0)))
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: None,
            max_duration: Some(Duration::from_secs(5)),
        }
    }

    fn mesh() -> AssetRef {
        AssetRef::remote("https://assets.meshy.ai/t/model.glb")
    }

    #[test]
    fn reports_progress_until_success() -> anyhow::Result<()> {
        let source = ScriptedSource::new(vec![
            Ok(JobSnapshot::pending(10)),
            Ok(JobSnapshot::pending(55)),
            Ok(JobSnapshot::succeeded(Some(mesh()))),
        ]);
        let mut seen = Vec::new();

        let result = poll_until_terminal(
            &source,
            &JobId::new("t-1"),
            &fast_policy(),
            &CancelToken::new(),
            |progress, status| seen.push((progress, status.to_string())),
        )?;

        assert_eq!(result.mesh, mesh());
        assert_eq!(result.job_id, JobId::new("t-1"));
        assert_eq!(
            seen,
            vec![(10, "PENDING".to_string()), (55, "PENDING".to_string())]
        );
        assert_eq!(source.calls(), 3);
        Ok(())
    }

    #[test]
    fn success_without_mesh_is_no_model_url() {
        let source = ScriptedSource::new(vec![Ok(JobSnapshot::succeeded(None))]);
        let err = poll_until_terminal(
            &source,
            &JobId::new("t-2"),
            &fast_policy(),
            &CancelToken::new(),
            |_, _| {},
        )
        .err();
        assert_eq!(err.map(|err| err.reason()), Some("no-model-url"));
    }

    #[test]
    fn failure_carries_vendor_detail_and_stops_callbacks() {
        let source = ScriptedSource::new(vec![
            Ok(JobSnapshot::pending(20)),
            Ok(JobSnapshot::failed("image too small")),
        ]);
        let mut updates = 0;
        let err = poll_until_terminal(
            &source,
            &JobId::new("t-3"),
            &fast_policy(),
            &CancelToken::new(),
            |_, _| updates += 1,
        )
        .err();

        assert_eq!(updates, 1);
        assert_eq!(
            err,
            Some(JobError::JobFailed {
                job_id: JobId::new("t-3"),
                status: "FAILED".to_string(),
                detail: "image too small".to_string(),
            })
        );
    }

    #[test]
    fn transport_error_ends_polling_immediately() {
        let source = ScriptedSource::new(vec![Err(ServiceError::Network {
            service: ServiceKind::MeshGeneration,
            detail: "connection reset".to_string(),
        })]);
        let err = poll_until_terminal(
            &source,
            &JobId::new("t-4"),
            &fast_policy(),
            &CancelToken::new(),
            |_, _| {},
        )
        .err();
        assert_eq!(err.map(|err| err.reason()), Some("poll-transport-error"));
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn cancel_during_update_stops_without_further_callbacks() {
        let source = ScriptedSource::new(vec![
            Ok(JobSnapshot::pending(5)),
            Ok(JobSnapshot::succeeded(Some(mesh()))),
        ]);
        let cancel = CancelToken::new();
        let mut updates = 0;

        let err = poll_until_terminal(
            &source,
            &JobId::new("t-5"),
            &fast_policy(),
            &cancel,
            |_, _| {
                updates += 1;
                cancel.cancel();
            },
        )
        .err();

        assert_eq!(err.map(|err| err.reason()), Some("canceled"));
        assert_eq!(updates, 1);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn canceled_before_start_never_polls() {
        let source = ScriptedSource::new(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = poll_until_terminal(
            &source,
            &JobId::new("t-6"),
            &fast_policy(),
            &cancel,
            |_, _| {},
        )
        .err();
        assert_eq!(err.map(|err| err.reason()), Some("canceled"));
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn attempt_budget_ends_in_timeout() {
        let source = ScriptedSource::new(Vec::new());
        let policy = PollPolicy {
            max_attempts: Some(3),
            ..fast_policy()
        };
        let err = poll_until_terminal(
            &source,
            &JobId::new("t-7"),
            &policy,
            &CancelToken::new(),
            |_, _| {},
        )
        .err();
        assert!(matches!(err, Some(JobError::Timeout { attempts: 3, .. })));
        assert_eq!(source.calls(), 3);
    }
}
