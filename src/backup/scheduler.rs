use crate::backup::config::{HostConfig, OrchestratorConfig};
use crate::backup::excludes::{ExcludeResolver, BUILTIN_EXCLUDES};
use crate::backup::job::{AbortRegistry, HostJob, JobOutcome};
use crate::backup::mode::BackupMode;
use crate::backup::remote::ssh::SshExecutor;
use crate::backup::remote::{DumpCoordinator, RemoteExecutor};
use crate::backup::report::{Report, ReportEntry};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::state::StateStore;
use crate::backup::transfer::rsync::RsyncTransfer;
use crate::backup::transfer::Transfer;
use bon::bon;
use chrono::Local;
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use std::sync::mpsc::channel;
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// Runs host jobs: one at a time with [`Scheduler::run_one`] or through a
/// bounded FIFO pool with [`Scheduler::run_all`].
pub struct Scheduler {
    config: OrchestratorConfig,
    store: StateStore,
    transfer: Arc<dyn Transfer>,
    dumps: DumpCoordinator,
    excludes: ExcludeResolver,
    aborts: AbortRegistry,
}

#[bon]
impl Scheduler {
    /// Collaborators default to rsync and ssh as configured.
    #[builder]
    pub fn new(
        config: OrchestratorConfig,
        transfer: Option<Arc<dyn Transfer>>,
        executor: Option<Arc<dyn RemoteExecutor>>,
    ) -> Self {
        let transfer = transfer.unwrap_or_else(|| {
            Arc::new(RsyncTransfer::new(&config.transfer.rsync_binary)) as Arc<dyn Transfer>
        });
        let executor = executor.unwrap_or_else(|| {
            Arc::new(SshExecutor::new(&config.ssh, &config.dump)) as Arc<dyn RemoteExecutor>
        });
        let defaults = if config.transfer.builtin_excludes {
            BUILTIN_EXCLUDES.iter().map(|s| s.to_string()).collect()
        } else {
            vec![]
        };
        Self {
            store: StateStore::new(&config.state_dir),
            dumps: DumpCoordinator::new(executor, &config.dump),
            excludes: ExcludeResolver::builder()
                .config_dir(&config.config_dir)
                .defaults(defaults)
                .build(),
            aborts: AbortRegistry::default(),
            transfer,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn excludes(&self) -> &ExcludeResolver {
        &self.excludes
    }

    /// Asks the job for `host` to stop at its next step boundary. Returns
    /// `false` when no job for `host` is running in this process.
    pub fn request_abort(&self, host: &str) -> bool {
        let accepted = self.aborts.request(host);
        if accepted {
            info!("Abort requested for {}", host);
        } else {
            warn!("No running job for {} to abort", host);
        }
        accepted
    }

    /// Runs one host job and adds its outcome to `report`. `mode` overrides
    /// the host's configured mode.
    pub fn run_one(&self, host: &HostConfig, mode: Option<BackupMode>, report: &Report) -> JobOutcome {
        let _span = info_span!("host", host = %host.name).entered();
        let outcome = HostJob {
            config: &self.config,
            host,
            mode: mode.unwrap_or(host.mode),
            store: &self.store,
            transfer: self.transfer.as_ref(),
            dumps: &self.dumps,
            excludes: &self.excludes,
            aborts: &self.aborts,
            today: Local::now().date_naive(),
        }
        .run();
        report.add(ReportEntry::from(&outcome).with_notify(host.notify.clone()));
        outcome
    }

    /// Runs every host on at most `concurrency_limit` workers. Hosts enter
    /// the queue by ascending priority and start in that order. Outcomes
    /// come back in queue order.
    pub fn run_all(
        &self,
        hosts: &[HostConfig],
        concurrency_limit: usize,
        report: &Report,
    ) -> Result<Vec<JobOutcome>> {
        if concurrency_limit == 0 {
            return Err(Error::InvalidArgument(
                "concurrency limit must be at least 1".into(),
            ));
        }
        let queue = hosts.iter().sorted_by_key(|h| h.priority).collect_vec();
        info!(
            "Running {} hosts with {} workers: {}",
            queue.len(),
            concurrency_limit,
            queue.iter().map(|h| h.name.as_str()).join(", ")
        );

        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency_limit)
            .thread_name(|i| format!("backup-worker-{i}"))
            .build()
            .map_err(Error::from)
            .add_msg("Building worker pool failed")?;

        let (outcome_tx, outcome_rx) = channel();
        pool.scope_fifo(|scope| {
            for (index, host) in queue.iter().enumerate() {
                let outcome_tx = outcome_tx.clone();
                scope.spawn_fifo(move |_| {
                    let _ = outcome_tx.send((index, self.run_one(host, None, report)));
                });
            }
        });
        drop(outcome_tx);

        Ok(outcome_rx
            .into_iter()
            .sorted_by_key(|(index, _)| *index)
            .map(|(_, outcome)| outcome)
            .collect())
    }

    /// Every host in the configuration.
    pub fn run_configured(&self, report: &Report) -> Result<Vec<JobOutcome>> {
        self.run_all(&self.config.hosts, self.config.parallel_jobs, report)
    }
}
