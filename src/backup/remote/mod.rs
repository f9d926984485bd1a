//! Remote database dump coordination.
//!
//! The coordinator only knows the [`RemoteExecutor`] capability: start a dump,
//! poll its state, cancel it. How the remote side is reached (and whether
//! completion is observed by polling markers or pushed) stays behind the trait.
//!
//! A job must not copy the remote dump directory before
//! [`DumpCoordinator::wait_for_db_dump`] has returned a terminal result.

pub mod ssh;

use crate::backup::config::DumpSettings;
use crate::backup::mode::DbType;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Local};
use derive_more::Display;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How to reach one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Configured host identifier.
    pub name: String,
    pub address: String,
    pub user: String,
    pub port: u16,
}

/// State of a remote dump as seen by one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpStatus {
    Running,
    Succeeded,
    Failed(String),
}

pub trait RemoteExecutor: Send + Sync {
    /// Starts the dump asynchronously. Returns once the remote side confirmed
    /// the dump process is running. Transport failures surface as
    /// [`Error::RemoteUnreachable`].
    fn start(&self, target: &RemoteTarget, db_types: &[DbType]) -> Result<()>;

    /// One look at the completion markers. `Err` means the transport failed,
    /// not the dump.
    fn poll(&self, target: &RemoteTarget) -> Result<DumpStatus>;

    fn cancel(&self, target: &RemoteTarget) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct DumpRequest {
    pub target: RemoteTarget,
    pub db_types: Vec<DbType>,
    pub triggered_at: DateTime<Local>,
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum DumpOutcome {
    #[display("success")]
    Success,
    #[display("failed:{_0}")]
    Failed(String),
    #[display("timeout")]
    Timeout,
    #[display("unreachable")]
    Unreachable,
}

#[derive(Clone, Debug)]
pub struct DumpResult {
    pub request: DumpRequest,
    pub poll_deadline: DateTime<Local>,
    pub outcome: DumpOutcome,
    pub waited: Duration,
}

impl DumpResult {
    /// Turns a non-success outcome into the matching error.
    pub fn into_result(self) -> Result<DumpResult> {
        let host = self.request.target.name.clone();
        match &self.outcome {
            DumpOutcome::Success => Ok(self),
            DumpOutcome::Failed(detail) => Err(Error::DumpFailed {
                host,
                detail: detail.clone(),
            }),
            DumpOutcome::Timeout => Err(Error::DumpTimeout {
                host,
                waited: self.waited,
            }),
            DumpOutcome::Unreachable => Err(Error::RemoteUnreachable {
                host,
                detail: "transport retries exhausted while polling".into(),
            }),
        }
    }
}

pub struct DumpCoordinator {
    executor: Arc<dyn RemoteExecutor>,
    retry_count: u32,
    retry_backoff: Duration,
}

impl DumpCoordinator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: &DumpSettings) -> Self {
        Self {
            executor,
            retry_count: settings.retry_count,
            retry_backoff: settings.retry_backoff,
        }
    }

    pub fn trigger_remote_dump(
        &self,
        target: &RemoteTarget,
        db_types: &[DbType],
    ) -> Result<DumpRequest> {
        info!(
            "Triggering database dump of [{}] on {}",
            db_types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            target.name
        );
        self.executor.start(target, db_types)?;
        Ok(DumpRequest {
            target: target.clone(),
            db_types: db_types.to_vec(),
            triggered_at: Local::now(),
        })
    }

    pub fn wait_for_db_dump(
        &self,
        request: &DumpRequest,
        timeout: Duration,
        poll_interval: Duration,
    ) -> DumpResult {
        let target = &request.target;
        let started = Instant::now();
        let deadline = started + timeout;
        let poll_deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Local::now().checked_add_signed(d))
            .unwrap_or_else(Local::now);
        let mut transport_failures = 0u32;

        let outcome = loop {
            match self.executor.poll(target) {
                Ok(DumpStatus::Succeeded) => break DumpOutcome::Success,
                Ok(DumpStatus::Failed(detail)) => break DumpOutcome::Failed(detail),
                Ok(DumpStatus::Running) => {
                    transport_failures = 0;
                    debug!("Dump on {} still running", target.name);
                }
                Err(e) => {
                    transport_failures += 1;
                    if transport_failures > self.retry_count {
                        warn!(
                            "Giving up polling {} after {} transport failures: {}",
                            target.name,
                            transport_failures,
                            e.summary()
                        );
                        break DumpOutcome::Unreachable;
                    }
                    let backoff = self.backoff(transport_failures);
                    warn!(
                        "Polling {} failed ({}/{}), retrying in {:?}: {}",
                        target.name,
                        transport_failures,
                        self.retry_count,
                        backoff,
                        e.summary()
                    );
                    sleep(backoff);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break DumpOutcome::Timeout;
            }
            sleep(poll_interval.min(deadline - now));
        };

        let waited = started.elapsed();
        info!("Dump on {} finished as {} after {:?}", target.name, outcome, waited);
        DumpResult {
            request: request.clone(),
            poll_deadline,
            outcome,
            waited,
        }
    }

    /// Best effort, used when a job is interrupted after triggering.
    pub fn cancel(&self, request: &DumpRequest) {
        if let Err(e) = self.executor.cancel(&request.target) {
            warn!(
                "Cancelling dump on {} failed: {}",
                request.target.name,
                e.summary()
            );
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted poll answers; once exhausted it keeps answering the
    /// last one.
    pub(crate) struct ScriptedExecutor {
        pub start_result: Mutex<Option<Error>>,
        pub polls: Mutex<VecDeque<Result<DumpStatus>>>,
        pub last: Mutex<DumpStatus>,
        pub poll_count: Mutex<u32>,
        pub cancelled: Mutex<bool>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new(polls: Vec<Result<DumpStatus>>, last: DumpStatus) -> Self {
            Self {
                start_result: Mutex::new(None),
                polls: Mutex::new(polls.into()),
                last: Mutex::new(last),
                poll_count: Mutex::new(0),
                cancelled: Mutex::new(false),
            }
        }

        pub(crate) fn unreachable() -> Self {
            let executor = Self::new(vec![], DumpStatus::Running);
            *executor.start_result.lock().unwrap() = Some(Error::RemoteUnreachable {
                host: "down".into(),
                detail: "ssh exit 255".into(),
            });
            executor
        }
    }

    impl RemoteExecutor for ScriptedExecutor {
        fn start(&self, _target: &RemoteTarget, _db_types: &[DbType]) -> Result<()> {
            match self.start_result.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn poll(&self, _target: &RemoteTarget) -> Result<DumpStatus> {
            *self.poll_count.lock().unwrap() += 1;
            match self.polls.lock().unwrap().pop_front() {
                Some(answer) => answer,
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }

        fn cancel(&self, _target: &RemoteTarget) -> Result<()> {
            *self.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }

    pub(crate) fn target(name: &str) -> RemoteTarget {
        RemoteTarget {
            name: name.into(),
            address: name.into(),
            user: "root".into(),
            port: 22,
        }
    }

    fn settings(retry_count: u32) -> DumpSettings {
        DumpSettings {
            retry_count,
            retry_backoff: Duration::from_millis(5),
            ..DumpSettings::default()
        }
    }

    fn transport_error() -> Error {
        Error::RemoteUnreachable {
            host: "db1".into(),
            detail: "connection reset".into(),
        }
    }

    #[test]
    fn test_success_marker_ends_wait() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec![Ok(DumpStatus::Running), Ok(DumpStatus::Running)],
            DumpStatus::Succeeded,
        ));
        let coordinator = DumpCoordinator::new(executor.clone(), &settings(3));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Postgres])
            .unwrap();

        let result = coordinator.wait_for_db_dump(
            &request,
            Duration::from_secs(5),
            Duration::from_millis(10),
        );
        assert_eq!(result.outcome, DumpOutcome::Success);
        assert_eq!(*executor.poll_count.lock().unwrap(), 3);
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_failure_marker_carries_detail() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec![],
            DumpStatus::Failed("pg_dump: connection refused".into()),
        ));
        let coordinator = DumpCoordinator::new(executor, &settings(3));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Postgres])
            .unwrap();

        let result =
            coordinator.wait_for_db_dump(&request, Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(result.outcome.to_string(), "failed:pg_dump: connection refused");
        assert!(matches!(
            result.into_result(),
            Err(Error::DumpFailed { detail, .. }) if detail == "pg_dump: connection refused"
        ));
    }

    #[test]
    fn test_timeout_not_before_deadline() {
        let executor = Arc::new(ScriptedExecutor::new(vec![], DumpStatus::Running));
        let coordinator = DumpCoordinator::new(executor.clone(), &settings(3));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Mysql])
            .unwrap();

        let timeout = Duration::from_millis(500);
        let started = Instant::now();
        let result = coordinator.wait_for_db_dump(&request, timeout, Duration::from_millis(100));

        assert_eq!(result.outcome, DumpOutcome::Timeout);
        assert!(started.elapsed() >= timeout);
        assert!(result.waited >= timeout);
        assert!(*executor.poll_count.lock().unwrap() >= 5);
        assert!(matches!(result.into_result(), Err(Error::DumpTimeout { .. })));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec![Err(transport_error()), Err(transport_error()), Ok(DumpStatus::Running)],
            DumpStatus::Succeeded,
        ));
        let coordinator = DumpCoordinator::new(executor, &settings(2));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Mysql])
            .unwrap();

        let result =
            coordinator.wait_for_db_dump(&request, Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(result.outcome, DumpOutcome::Success);
    }

    #[test]
    fn test_exhausted_retries_are_unreachable() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec![Err(transport_error()), Err(transport_error()), Err(transport_error())],
            DumpStatus::Succeeded,
        ));
        let coordinator = DumpCoordinator::new(executor.clone(), &settings(2));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Mysql])
            .unwrap();

        let result =
            coordinator.wait_for_db_dump(&request, Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(result.outcome, DumpOutcome::Unreachable);
        assert_eq!(*executor.poll_count.lock().unwrap(), 3);
        assert!(matches!(result.into_result(), Err(Error::RemoteUnreachable { .. })));
    }

    #[test]
    fn test_trigger_fails_fast_when_unreachable() {
        let executor = Arc::new(ScriptedExecutor::unreachable());
        let coordinator = DumpCoordinator::new(executor.clone(), &settings(3));
        let started = Instant::now();

        let result = coordinator.trigger_remote_dump(&target("down"), &[DbType::Redis]);
        assert!(matches!(result, Err(Error::RemoteUnreachable { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*executor.poll_count.lock().unwrap(), 0);
    }

    #[test]
    fn test_cancel_reaches_executor() {
        let executor = Arc::new(ScriptedExecutor::new(vec![], DumpStatus::Running));
        let coordinator = DumpCoordinator::new(executor.clone(), &settings(3));
        let request = coordinator
            .trigger_remote_dump(&target("db1"), &[DbType::Mysql])
            .unwrap();
        coordinator.cancel(&request);
        assert!(*executor.cancelled.lock().unwrap());
    }
}
