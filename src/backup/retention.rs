use crate::backup::result_error::error::Error;
use crate::backup::snapshot::{latest_target, parse_snapshot_date, LATEST};
use chrono::{Days, Local, NaiveDate};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub struct RotationSummary {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub errors: Vec<Error>,
}

/// Deletes snapshots older than `retention_days` days before today.
pub fn rotate(host_root: &Path, retention_days: u32) -> RotationSummary {
    rotate_at(host_root, retention_days, Local::now().date_naive())
}

/// Deletes every date-named snapshot strictly older than
/// `today - retention_days`. Names that do not parse as dates, `latest` and
/// the directory `latest` points to are never touched. `0` keeps everything.
pub fn rotate_at(host_root: &Path, retention_days: u32, today: NaiveDate) -> RotationSummary {
    let mut summary = RotationSummary::default();
    if retention_days == 0 {
        debug!("Rotation disabled for {:?}", host_root);
        return summary;
    }
    let Some(cutoff) = today.checked_sub_days(Days::new(retention_days.into())) else {
        return summary;
    };

    let entries = match std::fs::read_dir(host_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return summary,
        Err(e) => {
            summary.errors.push(Error::RotationIo {
                path: host_root.to_path_buf(),
                source: e,
            });
            return summary;
        }
    };
    let protected = latest_target(host_root);

    let candidates = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != LATEST)
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let date = parse_snapshot_date(entry.file_name().to_str()?)?;
            Some((date, entry.path()))
        })
        .sorted()
        .collect_vec();

    for (date, path) in candidates {
        if date >= cutoff || protected.as_deref() == Some(path.as_path()) {
            summary.kept += 1;
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(_) => {
                info!("Removed expired snapshot {:?}", path);
                summary.removed.push(path);
            }
            Err(e) => {
                let e = Error::RotationIo { path, source: e };
                error!("{}", e);
                summary.errors.push(e);
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn snapshot_root(names: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for name in names {
            std::fs::create_dir_all(temp.path().join(name).join("files")).unwrap();
        }
        temp
    }

    #[test]
    fn test_rotate_removes_only_older_than_cutoff() {
        let temp = snapshot_root(&[
            "2026-10-10",
            "2026-10-13",
            "2026-10-14",
            "2026-10-15",
            "2026-10-16",
            "2026-10-17",
            "notes",
        ]);
        let summary = rotate_at(temp.path(), 3, date("2026-10-17"));

        let mut removed = summary
            .removed
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect_vec();
        removed.sort();
        assert_eq!(removed, vec!["2026-10-10", "2026-10-13"]);
        assert_eq!(summary.kept, 4);
        assert!(summary.errors.is_empty());
        assert!(temp.path().join("2026-10-14").is_dir());
        assert!(temp.path().join("notes").is_dir());
    }

    #[test]
    fn test_rotate_recognizes_legacy_names() {
        let temp = snapshot_root(&["daily.2026-09-01", "2026-09-02_030000", "2026-10-17"]);
        let summary = rotate_at(temp.path(), 7, date("2026-10-17"));
        assert_eq!(summary.removed.len(), 2);
        assert!(temp.path().join("2026-10-17").is_dir());
    }

    #[test]
    fn test_rotate_zero_days_keeps_everything() {
        let temp = snapshot_root(&["2000-01-01"]);
        let summary = rotate_at(temp.path(), 0, date("2026-10-17"));
        assert!(summary.removed.is_empty());
        assert!(temp.path().join("2000-01-01").is_dir());
    }

    #[test]
    #[cfg(unix)]
    fn test_rotate_keeps_latest_target() {
        let temp = snapshot_root(&["2026-09-01", "2026-09-02"]);
        std::os::unix::fs::symlink("2026-09-02", temp.path().join(LATEST)).unwrap();

        let summary = rotate_at(temp.path(), 3, date("2026-10-17"));
        assert_eq!(summary.removed, vec![temp.path().join("2026-09-01")]);
        assert!(temp.path().join("2026-09-02").is_dir());
        assert!(std::fs::symlink_metadata(temp.path().join(LATEST)).is_ok());
    }

    #[test]
    fn test_rotate_missing_root() {
        let temp = TempDir::new().unwrap();
        let summary = rotate_at(&temp.path().join("nope"), 3, date("2026-10-17"));
        assert!(summary.removed.is_empty() && summary.errors.is_empty());
    }
}
