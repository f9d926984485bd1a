use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use timemachine::backup::config::{HostConfig, OrchestratorConfig};
use timemachine::backup::mode::BackupMode;
use timemachine::backup::report::report_init;
use timemachine::backup::result_error::error::Error;
use timemachine::backup::result_error::result::{convert_error_vec, Result};
use timemachine::backup::retention::rotate;
use timemachine::backup::scheduler::Scheduler;
use timemachine::backup::snapshot::{host_root, list_snapshots};
use timemachine::backup::state::StateStore;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Back up a fleet of hosts into dated, hard-linked snapshots
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every configured host, or only one
    Run {
        #[arg(long)]
        host: Option<String>,
        /// Overrides the configured mode (full, files-only, db-only)
        #[arg(long)]
        mode: Option<BackupMode>,
        /// Name used in the report subject and log file
        #[arg(long, default_value = "nightly")]
        label: String,
    },
    /// Prune expired snapshots of a host
    Rotate {
        #[arg(long)]
        host: String,
    },
    /// Print the exclude patterns a host would be backed up with
    Excludes {
        #[arg(long)]
        host: String,
    },
    /// List the snapshots of a host, newest first
    Snapshots {
        #[arg(long)]
        host: String,
    },
    /// Ask a running job for a host to stop at its next step
    Abort {
        #[arg(long)]
        host: String,
    },
    /// Print the last recorded state of every host
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    match OrchestratorConfig::load(&args.config).and_then(|config| execute(config, args.command))
    {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}

fn known_host<'a>(config: &'a OrchestratorConfig, host: &str) -> Result<&'a HostConfig> {
    config
        .host(host)
        .ok_or_else(|| Error::InvalidArgument(format!("host {host:?} is not configured")))
}

fn execute(config: OrchestratorConfig, command: Command) -> Result<i32> {
    match command {
        Command::Run { host, mode, label } => {
            let scheduler = Scheduler::builder().config(config.clone()).build();
            let report = report_init(label);
            let outcomes = match host {
                Some(name) => vec![scheduler.run_one(known_host(&config, &name)?, mode, &report)],
                None => {
                    let hosts = config
                        .hosts
                        .iter()
                        .cloned()
                        .map(|mut h| {
                            h.mode = mode.unwrap_or(h.mode);
                            h
                        })
                        .collect::<Vec<_>>();
                    scheduler.run_all(&hosts, config.parallel_jobs, &report)?
                }
            };
            let sent = report.send(&config.log_dir, &config.alerts);
            println!("{}", sent.summary);
            Ok(if outcomes.iter().any(|o| o.is_failed()) { 1 } else { 0 })
        }
        Command::Rotate { host } => {
            let root = host_root(&config.backup_root, &known_host(&config, &host)?.name);
            let summary = rotate(&root, config.retention_days);
            summary.removed.iter().for_each(|p| println!("removed {}", p.display()));
            convert_error_vec(summary.errors)?;
            Ok(0)
        }
        Command::Excludes { host } => {
            let scheduler = Scheduler::builder().config(config.clone()).build();
            scheduler
                .excludes()
                .resolve(&known_host(&config, &host)?.name)?
                .iter()
                .for_each(|p| println!("{p}"));
            Ok(0)
        }
        Command::Snapshots { host } => {
            let root = host_root(&config.backup_root, &known_host(&config, &host)?.name);
            for snapshot in list_snapshots(&root)? {
                println!(
                    "{}{}{}{}",
                    snapshot.name,
                    if snapshot.has_files { "  files" } else { "" },
                    if snapshot.has_db { "  sql" } else { "" },
                    if snapshot.is_latest { "  (latest)" } else { "" }
                );
            }
            Ok(0)
        }
        Command::Abort { host } => {
            StateStore::new(&config.state_dir).request_abort(&known_host(&config, &host)?.name)?;
            Ok(0)
        }
        Command::Status => {
            for record in StateStore::new(&config.state_dir).list()? {
                println!("{}", record.to_line());
            }
            Ok(0)
        }
    }
}
