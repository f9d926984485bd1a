//! Exclude pattern resolution.
//!
//! Order matters: the transfer tool evaluates the patterns as a list, and a
//! host file may re-include (`!pattern` / `+ pattern`) something excluded by
//! the global file, so host entries always come last. Duplicates are kept.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Virtual filesystems and volatile paths no host backup wants.
pub const BUILTIN_EXCLUDES: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/tmp",
    "/mnt",
    "/media",
    "/lost+found",
    "/swapfile",
    "/var/tmp",
    "/var/cache/apt/archives",
    "/var/lib/docker/overlay2",
    "/var/log/journal",
    "/home/*/.cache",
    "/root/.cache",
];

pub type ExcludePatternSet = Vec<String>;

#[derive(Clone, Debug, Builder)]
pub struct ExcludeResolver {
    #[builder(into)]
    config_dir: PathBuf,
    #[builder(default = BUILTIN_EXCLUDES.iter().map(|s| s.to_string()).collect())]
    defaults: Vec<String>,
}

impl ExcludeResolver {
    pub fn global_file(&self) -> PathBuf {
        self.config_dir.join("exclude.conf")
    }

    pub fn host_file(&self, host: &str) -> PathBuf {
        self.config_dir.join(format!("exclude.{host}.conf"))
    }

    /// Built-in defaults, then the global file, then the host file if present.
    pub fn resolve(&self, host: &str) -> Result<ExcludePatternSet> {
        let mut patterns = self.defaults.clone();
        patterns.extend(read_patterns(&self.global_file())?);
        patterns.extend(read_patterns(&self.host_file(host))?);
        debug!("Resolved {} exclude patterns for {}", patterns.len(), host);
        Ok(patterns)
    }
}

/// Missing file means no patterns.
fn read_patterns(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
        Err(e) => Err(Error::from(e).add_msg(format!("Reading exclude file {path:?} failed"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver(dir: &Path) -> ExcludeResolver {
        ExcludeResolver::builder()
            .config_dir(dir)
            .defaults(vec![])
            .build()
    }

    #[test]
    fn test_global_then_host() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("exclude.conf"), "/proc\n/sys\n").unwrap();
        std::fs::write(temp.path().join("exclude.host-A.conf"), "/data/cache\n").unwrap();

        assert_eq!(
            resolver(temp.path()).resolve("host-A").unwrap(),
            vec!["/proc", "/sys", "/data/cache"]
        );
    }

    #[test]
    fn test_host_file_only_applies_to_its_host() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("exclude.conf"), "/proc\n").unwrap();
        std::fs::write(temp.path().join("exclude.host-A.conf"), "/data/cache\n").unwrap();

        assert_eq!(resolver(temp.path()).resolve("host-B").unwrap(), vec!["/proc"]);
    }

    #[test]
    fn test_comments_blank_lines_and_duplicates() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("exclude.conf"),
            "# global\n\n  /var/log  \n/var/log\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("exclude.web.conf"), "!/var/log/app\n").unwrap();

        assert_eq!(
            resolver(temp.path()).resolve("web").unwrap(),
            vec!["/var/log", "/var/log", "!/var/log/app"]
        );
    }

    #[test]
    fn test_defaults_come_first() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("exclude.conf"), "/srv/tmp\n").unwrap();
        let resolver = ExcludeResolver::builder().config_dir(temp.path()).build();

        let patterns = resolver.resolve("web").unwrap();
        assert_eq!(&patterns[..BUILTIN_EXCLUDES.len()], BUILTIN_EXCLUDES);
        assert_eq!(patterns.last().map(String::as_str), Some("/srv/tmp"));
    }

    #[test]
    fn test_no_files_at_all() {
        let temp = TempDir::new().unwrap();
        assert!(resolver(temp.path()).resolve("web").unwrap().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        // A directory where the file should be cannot be read as text.
        std::fs::create_dir(temp.path().join("exclude.conf")).unwrap();
        assert!(resolver(temp.path()).resolve("web").is_err());
    }
}
