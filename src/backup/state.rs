//! Per-host state records.
//!
//! Each host has one line in `state_dir/proc-<host>.state`:
//!
//! ```text
//! pid|host|mode|YYYY-MM-DD HH:MM:SS|status
//! ```
//!
//! The record is replaced atomically and survives the run, so it can be
//! queried until the next run for that host overwrites it.

use crate::backup::function_path;
use crate::backup::mode::BackupMode;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use chrono::{DateTime, Local, NaiveDateTime};
use function_name::named;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Skipped,
    Failed(Option<String>),
}

impl JobStatus {
    pub fn failed<S: AsRef<str>>(detail: S) -> Self {
        let detail = detail
            .as_ref()
            .replace(['\n', '\r'], " ")
            .trim()
            .to_string();
        Self::Failed((!detail.is_empty()).then_some(detail))
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Failed(None) => write!(f, "failed"),
            JobStatus::Failed(Some(detail)) => write!(f, "failed: {detail}"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "skipped" => Ok(JobStatus::Skipped),
            "failed" => Ok(JobStatus::Failed(None)),
            s => s
                .strip_prefix("failed: ")
                .map(JobStatus::failed)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown job status {s:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostJobRecord {
    pub pid: u32,
    pub host: String,
    pub mode: BackupMode,
    pub started_at: NaiveDateTime,
    pub status: JobStatus,
}

impl HostJobRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.pid,
            self.host,
            self.mode,
            self.started_at.format(TIMESTAMP_FORMAT),
            self.status
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("malformed state record {line:?}"));
        let mut fields = line.trim_end().splitn(5, '|');
        let mut next = || fields.next().ok_or_else(invalid);
        let pid = next()?.parse::<u32>().map_err(|_| invalid())?;
        let host = next()?.to_string();
        let mode = next()?.parse::<BackupMode>()?;
        let started_at =
            NaiveDateTime::parse_from_str(next()?, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
        let status = next()?.parse::<JobStatus>()?;
        Ok(Self {
            pid,
            host,
            mode,
            started_at,
            status,
        })
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a cheap liveness probe a recorded pid is assumed alive, which
/// errs on the side of skipping.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("proc-{host}.state"))
    }

    fn guard_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("proc-{host}.lock"))
    }

    pub fn abort_request_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("abort-{host}.request"))
    }

    pub fn read(&self, host: &str) -> Result<Option<HostJobRecord>> {
        let path = self.record_path(host);
        match std::fs::read_to_string(&path) {
            Ok(content) => HostJobRecord::parse_line(&content)
                .add_msg(format!("Reading state record {path:?} failed"))
                .map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e).add_msg(format!("Reading state record {path:?} failed"))),
        }
    }

    /// Replaces the record through a temp file in the same directory.
    #[named]
    pub fn write(&self, record: &HostJobRecord) -> Result<()> {
        let path = self.record_path(&record.host);
        let mut temp = NamedTempFile::new_in(&self.dir)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        writeln!(temp, "{}", record.to_line())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        temp.persist(&path)
            .map_err(Error::from)
            .add_msg(format!("Persisting state record {path:?} failed"))
            .add_fn_name(function_path!())?;
        debug!("{} state: {}", record.host, record.status);
        Ok(())
    }

    /// Every readable record, sorted by host. Malformed records are logged
    /// and left out.
    pub fn list(&self) -> Result<Vec<HostJobRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(Error::from(e).add_msg(format!("Listing {:?} failed", self.dir)));
            }
        };
        let mut records = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let host = name.strip_prefix("proc-")?.strip_suffix(".state")?.to_string();
                match self.read(&host) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Ignoring unreadable state record for {}: {}", host, e.summary());
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(records)
    }

    /// Takes the host lock and records `running`.
    ///
    /// Fails with [`Error::LockContention`] when a live process already holds
    /// it. A `running` record left by a dead process is taken over.
    #[named]
    pub fn try_acquire(&self, host: &str, mode: BackupMode) -> Result<HostLock<'_>> {
        let _guard = self.lock_guard(host)?;

        if let Some(previous) = self.read(host)? {
            if previous.status == JobStatus::Running {
                if pid_alive(previous.pid) {
                    return Err(Error::LockContention {
                        host: host.to_string(),
                        pid: previous.pid,
                    });
                }
                warn!(
                    "Recovering stale lock for {} left by dead pid {} (started {})",
                    host,
                    previous.pid,
                    previous.started_at.format(TIMESTAMP_FORMAT)
                );
            }
        }

        let record = HostJobRecord {
            pid: std::process::id(),
            host: host.to_string(),
            mode,
            started_at: Local::now().naive_local(),
            status: JobStatus::Running,
        };
        self.write(&record).add_fn_name(function_path!())?;
        info!("Acquired lock for {}", host);
        Ok(HostLock {
            store: self,
            record,
            finished: false,
        })
    }

    /// Short-lived guard file serializing the read-check-write in
    /// [`StateStore::try_acquire`] across processes.
    fn lock_guard(&self, host: &str) -> Result<LockGuard> {
        let path = self.guard_path(host);
        for attempt in 0..2 {
            match File::create_new(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .map_err(Error::from)
                        .add_msg(format!("Writing lock guard {path:?} failed"))?;
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|pid| pid.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if attempt == 0 && !pid_alive(pid) => {
                            warn!("Removing stale lock guard {:?} of dead pid {}", path, pid);
                            let _ = std::fs::remove_file(&path);
                        }
                        pid => {
                            return Err(Error::LockContention {
                                host: host.to_string(),
                                pid: pid.unwrap_or_default(),
                            });
                        }
                    }
                }
                Err(e) => {
                    return Err(
                        Error::from(e).add_msg(format!("Creating lock guard {path:?} failed"))
                    );
                }
            }
        }
        Err(Error::LockContention {
            host: host.to_string(),
            pid: 0,
        })
    }

    /// Leaves an abort request for a job running in any process.
    pub fn request_abort(&self, host: &str) -> Result<()> {
        let path = self.abort_request_path(host);
        std::fs::write(&path, std::process::id().to_string())
            .map_err(Error::from)
            .add_msg(format!("Writing abort request {path:?} failed"))
    }

    /// Whether an abort request was made at or after `since`.
    pub fn abort_requested_since(&self, host: &str, since: DateTime<Local>) -> bool {
        std::fs::metadata(self.abort_request_path(host))
            .and_then(|m| m.modified())
            .map(|modified| DateTime::<Local>::from(modified) >= since)
            .unwrap_or(false)
    }

    pub fn clear_abort_request(&self, host: &str) {
        match std::fs::remove_file(self.abort_request_path(host)) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                warn!("Cannot remove abort request for {}: {}", host, e)
            }
            _ => {}
        }
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Held while a job runs. Records `failed: aborted` if dropped before
/// [`HostLock::finish`].
#[derive(Debug)]
pub struct HostLock<'a> {
    store: &'a StateStore,
    record: HostJobRecord,
    finished: bool,
}

impl HostLock<'_> {
    pub fn record(&self) -> &HostJobRecord {
        &self.record
    }

    pub fn finish(mut self, status: JobStatus) -> Result<()> {
        self.finished = true;
        self.record.status = status;
        self.store.write(&self.record)
    }
}

impl Drop for HostLock<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.record.status = JobStatus::failed("aborted");
        if let Err(e) = self.store.write(&self.record) {
            error!("Cannot record abort for {}: {}", self.record.host, e.summary());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(status: JobStatus) -> HostJobRecord {
        HostJobRecord {
            pid: 4242,
            host: "web-01".into(),
            mode: BackupMode::FilesOnly,
            started_at: NaiveDateTime::parse_from_str("2026-10-17 02:00:05", TIMESTAMP_FORMAT)
                .unwrap(),
            status,
        }
    }

    #[test]
    fn test_record_line_format() {
        let line = record(JobStatus::failed("rsync exit 23: some files\nvanished")).to_line();
        assert_eq!(
            line,
            "4242|web-01|files-only|2026-10-17 02:00:05|failed: rsync exit 23: some files vanished"
        );
        assert_eq!(
            HostJobRecord::parse_line(&line).unwrap().status,
            JobStatus::Failed(Some("rsync exit 23: some files vanished".into()))
        );
    }

    #[test]
    fn test_detail_may_contain_separator() {
        let original = record(JobStatus::failed("exit 2 | broken pipe"));
        assert_eq!(HostJobRecord::parse_line(&original.to_line()).unwrap(), original);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HostJobRecord::parse_line("").is_err());
        assert!(HostJobRecord::parse_line("abc|web|full|2026-10-17 02:00:05|running").is_err());
        assert!(HostJobRecord::parse_line("1|web|full|yesterday|running").is_err());
        assert!(HostJobRecord::parse_line("1|web|full|2026-10-17 02:00:05|paused").is_err());
    }

    #[test]
    fn test_acquire_then_finish() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());

        let lock = store.try_acquire("web-01", BackupMode::Full).unwrap();
        assert_eq!(lock.record().pid, std::process::id());
        assert_eq!(store.read("web-01").unwrap().unwrap().status, JobStatus::Running);
        assert!(!store.guard_path("web-01").exists());

        lock.finish(JobStatus::Completed).unwrap();
        let persisted = store.read("web-01").unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
        assert_eq!(persisted.mode, BackupMode::Full);
    }

    #[test]
    fn test_live_lock_is_contention() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());

        let _held = store.try_acquire("web-01", BackupMode::Full).unwrap();
        let second = store.try_acquire("web-01", BackupMode::Full);
        match second {
            Err(Error::LockContention { host, pid }) => {
                assert_eq!(host, "web-01");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("Expected LockContention, got {other:?}"),
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_stale_lock_is_recovered() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        let mut stale = record(JobStatus::Running);
        stale.pid = u32::MAX - 1;
        store.write(&stale).unwrap();
        std::fs::write(store.guard_path("web-01"), (u32::MAX - 1).to_string()).unwrap();

        let lock = store.try_acquire("web-01", BackupMode::DbOnly).unwrap();
        assert_eq!(lock.record().mode, BackupMode::DbOnly);
        lock.finish(JobStatus::Completed).unwrap();
    }

    #[test]
    fn test_dropped_lock_records_aborted() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        drop(store.try_acquire("web-01", BackupMode::Full).unwrap());

        assert_eq!(
            store.read("web-01").unwrap().unwrap().status,
            JobStatus::Failed(Some("aborted".into()))
        );
        // A finished record no longer blocks the next run.
        assert!(store.try_acquire("web-01", BackupMode::Full).is_ok());
    }

    #[test]
    fn test_list_records() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        let mut other = record(JobStatus::Skipped);
        other.host = "app-01".into();
        store.write(&record(JobStatus::Completed)).unwrap();
        store.write(&other).unwrap();
        std::fs::write(store.record_path("broken"), "nonsense").unwrap();

        let hosts = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.host)
            .collect::<Vec<_>>();
        assert_eq!(hosts, vec!["app-01", "web-01"]);
    }

    #[test]
    fn test_abort_request_respects_start_time() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        let before = Local::now() - chrono::Duration::seconds(5);
        assert!(!store.abort_requested_since("web-01", before));

        store.request_abort("web-01").unwrap();
        assert!(store.abort_requested_since("web-01", before));
        assert!(!store.abort_requested_since("web-01", Local::now() + chrono::Duration::hours(1)));

        store.clear_abort_request("web-01");
        assert!(!store.abort_requested_since("web-01", before));
    }
}
