use crate::backup::mode::{BackupMode, DbType};
use crate::backup::notifications::NotificationConfig;
use crate::backup::remote::RemoteTarget;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::validate::{
    validate_absolute_remote_path, validate_dir_exist_or_created, validate_host_name,
    validate_writable_dir,
};
use bon::Builder;
use itertools::Itertools;
use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Everything the engine needs, loaded once at start-up and passed down by
/// reference.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[validate(custom(function = validate_dir_exist_or_created))]
    pub backup_root: PathBuf,
    /// Holds `exclude.conf` and the `exclude.<host>.conf` overrides.
    pub config_dir: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    pub state_dir: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    pub log_dir: PathBuf,
    #[serde(default = "default_parallel_jobs")]
    #[validate(range(min = 1, max = 64))]
    pub parallel_jobs: usize,
    /// Days of snapshots to keep. `0` disables rotation.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    #[validate(nested)]
    pub transfer: TransferSettings,
    #[serde(default)]
    #[validate(nested)]
    pub ssh: SshSettings,
    #[serde(default)]
    #[validate(nested)]
    pub dump: DumpSettings,
    #[serde(default)]
    #[validate(nested)]
    pub alerts: AlertConfig,
    #[validate(nested)]
    #[validate(custom(function = validate_unique_hosts))]
    pub hosts: Vec<HostConfig>,
}

fn default_parallel_jobs() -> usize {
    5
}

fn default_retention_days() -> u32 {
    7
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSettings {
    pub rsync_binary: PathBuf,
    /// KiB/s, applied to every host without its own limit.
    #[validate(range(min = 1))]
    pub bandwidth_limit: Option<u32>,
    pub extra_options: Vec<String>,
    /// Prepend the virtual filesystem and cache exclusions.
    pub builtin_excludes: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            rsync_binary: "rsync".into(),
            bandwidth_limit: None,
            extra_options: vec![],
            builtin_excludes: true,
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub binary: PathBuf,
    #[validate(length(min = 1))]
    pub user: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: "ssh".into(),
            user: "root".into(),
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct DumpSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = validate_non_zero_duration))]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = validate_non_zero_duration))]
    pub timeout: Duration,
    /// Consecutive transport failures tolerated while polling.
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// How long to wait for the remote start marker after triggering.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = validate_non_zero_duration))]
    pub start_timeout: Duration,
    #[validate(custom(function = validate_absolute_remote_path))]
    pub remote_script: String,
    #[validate(custom(function = validate_absolute_remote_path))]
    pub remote_dir: String,
}

impl Default for DumpSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2 * 60 * 60),
            retry_count: 3,
            retry_backoff: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            remote_script: "/usr/local/bin/tm-db-dump.sh".into(),
            remote_dir: "/var/backups/timemachine/sql".into(),
        }
    }
}

fn validate_non_zero_duration(d: &Duration) -> std::result::Result<(), ValidationError> {
    if d.is_zero() {
        return Err(ValidationError::new("ZeroDuration")
            .with_message("duration must be greater than zero".into()));
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    pub enabled: bool,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    /// Channel names to attempt, in order.
    pub methods: Vec<String>,
    #[validate(custom(function = validate_channels))]
    pub channels: BTreeMap<String, NotificationConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_success: true,
            notify_on_failure: true,
            methods: vec![],
            channels: BTreeMap::new(),
        }
    }
}

fn validate_channels(
    channels: &BTreeMap<String, NotificationConfig>,
) -> std::result::Result<(), ValidationError> {
    let invalid = channels
        .iter()
        .filter_map(|(name, channel)| channel.validate().err().map(|e| format!("{name}: {e}")))
        .join("; ");
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("InvalidChannel").with_message(invalid.into()))
    }
}

/// One managed host.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_host_scope))]
pub struct HostConfig {
    #[validate(custom(function = validate_host_name))]
    #[builder(into)]
    pub name: String,
    /// Network address when it differs from `name`.
    #[builder(into)]
    pub address: Option<String>,
    #[builder(into)]
    pub user: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    #[builder(default)]
    pub mode: BackupMode,
    /// Lower runs first.
    #[serde(default = "default_priority")]
    #[builder(default = default_priority())]
    pub priority: u32,
    #[serde(default)]
    #[builder(default)]
    pub db_types: Vec<DbType>,
    #[serde(default = "default_source_paths")]
    #[builder(default = default_source_paths())]
    #[validate(custom(function = validate_source_paths))]
    pub source_paths: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub no_rotate: bool,
    #[validate(range(min = 1))]
    pub bandwidth_limit: Option<u32>,
    #[serde(default)]
    #[builder(default)]
    pub extra_rsync_options: Vec<String>,
    /// Also receives the run report by e-mail.
    pub notify: Option<Mailbox>,
}

fn default_priority() -> u32 {
    10
}

fn default_source_paths() -> Vec<String> {
    vec!["/".to_string()]
}

fn validate_source_paths(paths: &[String]) -> std::result::Result<(), ValidationError> {
    if paths.is_empty() {
        return Err(ValidationError::new("NoSourcePaths")
            .with_message("source_paths must not be empty".into()));
    }
    paths.iter().try_for_each(validate_absolute_remote_path)
}

fn validate_host_scope(host: &HostConfig) -> std::result::Result<(), ValidationError> {
    if host.mode == BackupMode::DbOnly && host.db_types.is_empty() {
        return Err(ValidationError::new("NoDatabases").with_message(
            format!("host {} is db-only but lists no db_types", host.name).into(),
        ));
    }
    Ok(())
}

fn validate_unique_hosts(hosts: &[HostConfig]) -> std::result::Result<(), ValidationError> {
    let duplicates = hosts.iter().map(|h| h.name.as_str()).duplicates().join(", ");
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("DuplicateHost")
            .with_message(format!("hosts listed more than once: {duplicates}").into()))
    }
}

impl HostConfig {
    pub fn remote_target(&self, ssh: &SshSettings) -> RemoteTarget {
        RemoteTarget {
            name: self.name.clone(),
            address: self.address.clone().unwrap_or_else(|| self.name.clone()),
            user: self.user.clone().unwrap_or_else(|| ssh.user.clone()),
            port: self.port.unwrap_or(ssh.port),
        }
    }
}

impl OrchestratorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, Self>(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }
}
