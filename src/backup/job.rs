//! One host's backup lifecycle.
//!
//! Pipeline: excludes, dump trigger, files transfer, dump wait, dump
//! transfer, `latest`, rotation. Every step returns a typed result and the
//! first error becomes the job's terminal status in [`HostJob::run`].

use crate::backup::config::{HostConfig, OrchestratorConfig};
use crate::backup::excludes::{ExcludePatternSet, ExcludeResolver};
use crate::backup::mode::BackupMode;
use crate::backup::remote::ssh::remote_shell;
use crate::backup::remote::{DumpCoordinator, DumpOutcome, RemoteTarget};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention::rotate_at;
use crate::backup::snapshot::Snapshot;
use crate::backup::state::{JobStatus, StateStore};
use crate::backup::transfer::{RsyncArgs, Transfer};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// In-process abort requests, keyed by host. Only hosts with a job in
/// progress accept a request, so nothing carries over to a later run.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    state: Mutex<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    active: HashSet<String>,
    requested: HashSet<String>,
}

impl AbortRegistry {
    /// Returns `false` when no job for `host` is in progress.
    pub fn request(&self, host: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.active.contains(host) {
            return false;
        }
        state.requested.insert(host.to_string());
        true
    }

    fn begin(&self, host: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requested.remove(host);
        state.active.insert(host.to_string());
    }

    fn end(&self, host: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requested.remove(host);
        state.active.remove(host);
    }

    fn take(&self, host: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requested
            .remove(host)
    }
}

/// Checked between pipeline steps, never inside one.
pub struct AbortSignal<'a> {
    host: &'a str,
    since: DateTime<Local>,
    registry: &'a AbortRegistry,
    store: &'a StateStore,
}

impl<'a> AbortSignal<'a> {
    pub fn new(
        host: &'a str,
        since: DateTime<Local>,
        registry: &'a AbortRegistry,
        store: &'a StateStore,
    ) -> Self {
        Self {
            host,
            since,
            registry,
            store,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.registry.take(self.host) || self.store.abort_requested_since(self.host, self.since)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    pub host: String,
    pub mode: BackupMode,
    pub status: JobStatus,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, JobStatus::Failed(_))
    }
}

pub struct HostJob<'a> {
    pub config: &'a OrchestratorConfig,
    pub host: &'a HostConfig,
    pub mode: BackupMode,
    pub store: &'a StateStore,
    pub transfer: &'a dyn Transfer,
    pub dumps: &'a DumpCoordinator,
    pub excludes: &'a ExcludeResolver,
    pub aborts: &'a AbortRegistry,
    pub today: NaiveDate,
}

impl HostJob<'_> {
    /// Takes the host lock, runs the pipeline and records the terminal status.
    pub fn run(self) -> JobOutcome {
        let started = Instant::now();
        let since = Local::now();
        let name = self.host.name.as_str();

        let lock = match self.store.try_acquire(name, self.mode) {
            Ok(lock) => lock,
            Err(e) => {
                let status = match e.root() {
                    Error::LockContention { pid, .. } => {
                        info!("Skipping {}: another run (pid {}) holds the lock", name, pid);
                        JobStatus::Skipped
                    }
                    _ => {
                        error!("Cannot take lock for {}: {}", name, e.summary());
                        JobStatus::failed(e.summary())
                    }
                };
                return self.outcome(status, started);
            }
        };

        self.aborts.begin(name);
        let abort = AbortSignal::new(name, since, self.aborts, self.store);
        let result = self.pipeline(&abort);
        self.aborts.end(name);
        let status = match result {
            Ok(()) => {
                info!("Backup of {} completed", name);
                JobStatus::Completed
            }
            Err(e) if e.is_interrupted() => {
                warn!("Backup of {} interrupted", name);
                self.store.clear_abort_request(name);
                JobStatus::failed("interrupted")
            }
            Err(e) => {
                error!("Backup of {} failed: {}", name, e.summary());
                JobStatus::failed(e.summary())
            }
        };

        if let Err(e) = lock.finish(status.clone()) {
            error!("Cannot record final status of {}: {}", name, e.summary());
        }
        self.outcome(status, started)
    }

    fn outcome(&self, status: JobStatus, started: Instant) -> JobOutcome {
        JobOutcome {
            host: self.host.name.clone(),
            mode: self.mode,
            status,
            duration: started.elapsed(),
        }
    }

    fn checkpoint(&self, abort: &AbortSignal) -> Result<()> {
        if abort.is_requested() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn pipeline(&self, abort: &AbortSignal) -> Result<()> {
        let host = self.host;
        let target = host.remote_target(&self.config.ssh);
        let snapshot = Snapshot::new(&self.config.backup_root, &host.name, self.today);
        self.checkpoint(abort)?;

        let excludes = if self.mode.includes_files() {
            Some(self.excludes.resolve(&host.name)?)
        } else {
            None
        };

        let dump = if self.mode.includes_db() && !host.db_types.is_empty() {
            Some(
                self.dumps
                    .trigger_remote_dump(&target, &host.db_types)
                    .add_msg("Database dump trigger")?,
            )
        } else {
            None
        };

        // A triggered dump must not outlive the job: a later run would read
        // its markers as its own.
        if let Err(e) = self.copy_files(abort, &target, &snapshot, excludes) {
            if let Some(request) = &dump {
                self.dumps.cancel(request);
            }
            return Err(e);
        }

        if let Some(request) = dump {
            let settings = &self.config.dump;
            let result = self
                .dumps
                .wait_for_db_dump(&request, settings.timeout, settings.poll_interval);
            if matches!(result.outcome, DumpOutcome::Timeout | DumpOutcome::Unreachable) {
                self.dumps.cancel(&request);
            }
            result.into_result()?;
            self.checkpoint(abort)?;

            let args = self.rsync_args(
                &target,
                vec![format!("{}/", settings.remote_dir.trim_end_matches('/'))],
                snapshot.sql_dir(),
                vec!["- .dump_*".to_string()],
                None,
            )?;
            self.transfer.transfer(&args).add_msg("Database dump transfer")?;
        }

        snapshot.mark_latest()?;

        if host.no_rotate {
            info!("Rotation disabled for {}", host.name);
        } else {
            let summary = rotate_at(snapshot.host_root(), self.config.retention_days, self.today);
            info!(
                "Rotation of {}: {} removed, {} kept, {} errors",
                host.name,
                summary.removed.len(),
                summary.kept,
                summary.errors.len()
            );
        }
        Ok(())
    }

    /// Everything between the dump trigger and the dump wait.
    fn copy_files(
        &self,
        abort: &AbortSignal,
        target: &RemoteTarget,
        snapshot: &Snapshot,
        excludes: Option<ExcludePatternSet>,
    ) -> Result<()> {
        self.checkpoint(abort)?;
        if let Some(excludes) = excludes {
            let args = self.rsync_args(
                target,
                self.host.source_paths.clone(),
                snapshot.files_dir(),
                excludes,
                snapshot.previous_files_dir(),
            )?;
            self.transfer.transfer(&args).add_msg("Files transfer")?;
            self.checkpoint(abort)?;
        }
        Ok(())
    }

    fn rsync_args(
        &self,
        target: &RemoteTarget,
        sources: Vec<String>,
        destination: PathBuf,
        filters: Vec<String>,
        link_dest: Option<PathBuf>,
    ) -> Result<RsyncArgs> {
        let transfer = &self.config.transfer;
        RsyncArgs::builder()
            .remote(format!("{}@{}", target.user, target.address))
            .remote_shell(remote_shell(&self.config.ssh, target))
            .sources(sources)
            .destination(destination)
            .filters(filters)
            .maybe_link_dest(link_dest)
            .maybe_bandwidth_limit(self.host.bandwidth_limit.or(transfer.bandwidth_limit))
            .extra_options(
                transfer
                    .extra_options
                    .iter()
                    .chain(&self.host.extra_rsync_options)
                    .cloned()
                    .collect(),
            )
            .build()
    }
}
