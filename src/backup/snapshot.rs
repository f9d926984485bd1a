//! On-disk snapshot layout:
//!
//! ```text
//! <backup_root>/<host>/<YYYY-MM-DD>/files/...
//! <backup_root>/<host>/<YYYY-MM-DD>/sql/...
//! <backup_root>/<host>/latest -> <YYYY-MM-DD>
//! ```

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use chrono::NaiveDate;
use function_name::named;
use itertools::Itertools;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use tracing::info;

pub const LATEST: &str = "latest";
pub const FILES_DIR: &str = "files";
pub const SQL_DIR: &str = "sql";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn host_root<P: AsRef<Path>>(backup_root: P, host: &str) -> PathBuf {
    backup_root.as_ref().join(host)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub host: String,
    pub date: NaiveDate,
    pub path: PathBuf,
}

impl Snapshot {
    pub fn new<P: AsRef<Path>>(backup_root: P, host: &str, date: NaiveDate) -> Self {
        Self {
            host: host.to_string(),
            date,
            path: host_root(backup_root, host).join(date.format(DATE_FORMAT).to_string()),
        }
    }

    pub fn files_dir(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }

    pub fn sql_dir(&self) -> PathBuf {
        self.path.join(SQL_DIR)
    }

    pub fn host_root(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }

    /// Hard-link base for the next files transfer: the files directory of the
    /// snapshot `latest` points at, or of the newest older snapshot holding
    /// files when `latest` came from a db-only run.
    pub fn previous_files_dir(&self) -> Option<PathBuf> {
        let root = self.host_root();
        latest_target(root)
            .filter(|previous| *previous != self.path)
            .map(|previous| previous.join(FILES_DIR))
            .filter(|files| files.is_dir())
            .or_else(|| {
                list_snapshots(root)
                    .ok()?
                    .into_iter()
                    .find(|s| s.has_files && s.date < self.date)
                    .map(|s| root.join(s.name).join(FILES_DIR))
            })
    }

    /// Repoints `latest` at this snapshot with a rename, so readers see either
    /// the old or the new target.
    #[named]
    pub fn mark_latest(&self) -> Result<()> {
        let root = self.host_root();
        let name = self
            .path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("snapshot path {:?}", self.path)))?;
        let tmp = root.join(format!(".{LATEST}.tmp-{}", std::process::id()));
        let _ = std::fs::remove_file(&tmp);

        symlink_dir(name, &tmp)
            .and_then(|_| std::fs::rename(&tmp, root.join(LATEST)))
            .map_err(Error::from)
            .add_msg(format!("Repointing {:?} to {:?} failed", root.join(LATEST), name))
            .add_fn_name(function_path!())?;
        info!("{} latest -> {:?}", self.host, name);
        Ok(())
    }
}

#[cfg(unix)]
fn symlink_dir<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink_dir<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(original, link)
}

/// Resolved target of `<host_root>/latest`.
pub fn latest_target(host_root: &Path) -> Option<PathBuf> {
    let target = std::fs::read_link(host_root.join(LATEST)).ok()?;
    Some(if target.is_absolute() {
        target
    } else {
        host_root.join(target)
    })
}

/// Date of a snapshot directory name: `YYYY-MM-DD`, `YYYY-MM-DD_HHMMSS` or the
/// legacy `daily.YYYY-MM-DD`.
pub fn parse_snapshot_date(name: &str) -> Option<NaiveDate> {
    let name = name.strip_prefix("daily.").unwrap_or(name);
    let (date, time) = match name.split_once('_') {
        Some((date, time)) => (date, Some(time)),
        None => (name, None),
    };
    if date.len() != 10 {
        return None;
    }
    if let Some(time) = time {
        if time.len() != 6 || !time.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub date: NaiveDate,
    pub has_files: bool,
    pub has_db: bool,
    pub is_latest: bool,
}

/// Date-named snapshots under `host_root`, newest first.
pub fn list_snapshots(host_root: &Path) -> Result<Vec<SnapshotInfo>> {
    if !host_root.is_dir() {
        return Ok(vec![]);
    }
    let latest = latest_target(host_root);
    let snapshots = std::fs::read_dir(host_root)
        .map_err(Error::from)
        .add_msg(format!("Listing {host_root:?} failed"))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let date = parse_snapshot_date(&name)?;
            let path = entry.path();
            let sql = path.join(SQL_DIR);
            Some(SnapshotInfo {
                has_files: path.join(FILES_DIR).is_dir(),
                has_db: std::fs::read_dir(&sql)
                    .map(|mut d| d.next().is_some())
                    .unwrap_or(false),
                is_latest: latest.as_deref() == Some(path.as_path()),
                name,
                date,
            })
        })
        .sorted_by_key(|s| Reverse((s.date, s.name.clone())))
        .collect();
    Ok(snapshots)
}
