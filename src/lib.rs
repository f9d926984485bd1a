//! # timemachine
//!
//! Nightly backup orchestration for a fleet of hosts: rsync snapshots with
//! hard-linked history, coordinated remote database dumps, retention and a
//! run report sent to the configured notification channels.
//!
//! ## Features
//!
//! - **Per-host jobs**: lock, transfer, dump, `latest` and rotation as one lifecycle
//! - **Bounded parallelism**: hosts queued by priority into a fixed size worker pool
//! - **Remote dumps**: triggered over ssh and awaited before the dump directory is copied
//! - **Retention**: date-named snapshots older than the window are pruned
//! - **Reports**: per-run log file plus e-mail and webhook notifications
//!
//! ## Quick Start
//!
//! ```no_run
//! use timemachine::backup::config::OrchestratorConfig;
//! use timemachine::backup::report::report_init;
//! use timemachine::backup::scheduler::Scheduler;
//!
//! let config = OrchestratorConfig::load("timemachine.yml")?;
//! let scheduler = Scheduler::builder().config(config.clone()).build();
//!
//! let report = report_init("nightly");
//! scheduler.run_configured(&report)?;
//! report.send(&config.log_dir, &config.alerts);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
