//! Run-scoped report ledger.
//!
//! Workers append entries concurrently with [`Report::add`]; [`Report::send`]
//! consumes the report, so the ledger is rendered, persisted, dispatched and
//! dropped exactly once.

use crate::backup::config::AlertConfig;
use crate::backup::job::JobOutcome;
use crate::backup::mode::BackupMode;
use crate::backup::notifications::{Notification, Severity};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::state::JobStatus;
use chrono::{DateTime, Local};
use derive_more::Display;
use lettre::message::Mailbox;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum EntryStatus {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("skipped")]
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    pub host: String,
    pub status: EntryStatus,
    pub duration: Duration,
    pub mode: BackupMode,
    pub detail: Option<String>,
    /// Host-specific recipient added to the e-mail fan-out.
    pub notify: Option<Mailbox>,
}

impl ReportEntry {
    pub fn with_notify(mut self, notify: Option<Mailbox>) -> Self {
        self.notify = notify;
        self
    }
}

impl From<&JobOutcome> for ReportEntry {
    fn from(outcome: &JobOutcome) -> Self {
        let (status, detail) = match &outcome.status {
            JobStatus::Completed => (EntryStatus::Success, None),
            JobStatus::Skipped => (
                EntryStatus::Skipped,
                Some("another run holds the lock".to_string()),
            ),
            JobStatus::Failed(detail) => (EntryStatus::Failed, detail.clone()),
            JobStatus::Running => (EntryStatus::Failed, Some("still running".to_string())),
        };
        Self {
            host: outcome.host.clone(),
            status,
            duration: outcome.duration,
            mode: outcome.mode,
            detail,
            notify: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Counts {
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// Result of one channel attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub method: String,
    pub success: bool,
    pub diagnostic: String,
}

#[derive(Debug)]
pub struct ReportSummary {
    pub counts: Counts,
    pub summary: String,
    pub log_path: Option<PathBuf>,
    pub rendered: String,
    pub channels: Vec<ChannelOutcome>,
}

pub struct Report {
    label: String,
    started_at: DateTime<Local>,
    entries: Mutex<Vec<ReportEntry>>,
}

pub fn report_init<S: Into<String>>(label: S) -> Report {
    Report {
        label: label.into(),
        started_at: Local::now(),
        entries: Mutex::new(vec![]),
    }
}

impl Report {
    pub fn add(&self, entry: ReportEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn counts(&self) -> Counts {
        count(&self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Renders and persists the log under `log_dir`, then notifies through
    /// the channels in `alerts` when the run outcome calls for it.
    pub fn send(self, log_dir: &Path, alerts: &AlertConfig) -> ReportSummary {
        self.send_via(log_dir, alerts, &Dispatcher::from_config(alerts))
    }

    pub fn send_via(
        self,
        log_dir: &Path,
        alerts: &AlertConfig,
        dispatcher: &Dispatcher,
    ) -> ReportSummary {
        let finished_at = Local::now();
        let entries = self
            .entries
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let counts = count(&entries);
        let summary = counts.summary();
        let rendered = render(&self.label, self.started_at, finished_at, &entries, &counts);
        info!("Report {}: {}", self.label, summary);

        let log_path = match persist_log(log_dir, &self.label, finished_at, &rendered) {
            Ok(path) => {
                info!("Report written to {:?}", path);
                Some(path)
            }
            Err(e) => {
                error!("Cannot write report log: {}", e.summary());
                None
            }
        };

        let any_failed = counts.failed > 0;
        let wanted = alerts.enabled
            && if any_failed {
                alerts.notify_on_failure
            } else {
                alerts.notify_on_success
            };
        let channels = if wanted {
            let severity = if any_failed {
                Severity::Error
            } else {
                Severity::Info
            };
            let subject = format!("[timemachine] {}: {}", self.label, summary);
            dispatcher.dispatch(&subject, &rendered, severity, &host_recipients(&entries))
        } else {
            vec![]
        };

        ReportSummary {
            counts,
            summary,
            log_path,
            rendered,
            channels,
        }
    }
}

fn count(entries: &[ReportEntry]) -> Counts {
    entries.iter().fold(Counts::default(), |mut counts, entry| {
        match entry.status {
            EntryStatus::Success => counts.succeeded += 1,
            EntryStatus::Failed => counts.failed += 1,
            EntryStatus::Skipped => counts.skipped += 1,
        }
        counts
    })
}

/// Per-host recipients in entry order, each address once.
fn host_recipients(entries: &[ReportEntry]) -> Vec<Mailbox> {
    let mut recipients: Vec<Mailbox> = vec![];
    for mailbox in entries.iter().filter_map(|e| e.notify.as_ref()) {
        if !recipients.iter().any(|r| r.email == mailbox.email) {
            recipients.push(mailbox.clone());
        }
    }
    recipients
}

/// `45s`, `2m 5s`, `1h 1m 1s`.
pub fn format_duration(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn render(
    label: &str,
    started_at: DateTime<Local>,
    finished_at: DateTime<Local>,
    entries: &[ReportEntry],
    counts: &Counts,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Backup report: {label}");
    let _ = writeln!(
        out,
        "Started: {}  Finished: {}",
        started_at.format("%Y-%m-%d %H:%M:%S"),
        finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "Summary: {}", counts.summary());

    for (title, status) in [
        ("FAILED", EntryStatus::Failed),
        ("OK", EntryStatus::Success),
        ("SKIP", EntryStatus::Skipped),
    ] {
        let _ = writeln!(out, "\n{title}");
        let mut section = entries.iter().filter(|e| e.status == status).peekable();
        if section.peek().is_none() {
            let _ = writeln!(out, "  (none)");
        }
        for entry in section {
            let _ = write!(
                out,
                "  {}  {}  {}",
                entry.host,
                format_duration(entry.duration.as_secs()),
                entry.mode
            );
            if let Some(detail) = &entry.detail {
                let _ = write!(out, "  {detail}");
            }
            out.push('\n');
        }
    }
    out
}

fn persist_log(
    log_dir: &Path,
    label: &str,
    finished_at: DateTime<Local>,
    rendered: &str,
) -> Result<PathBuf> {
    let name = sanitize_filename::sanitize(format!(
        "report-{label}-{}.log",
        finished_at.format("%Y-%m-%d_%H%M%S")
    ));
    let path = log_dir.join(name);
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::write(&path, rendered))
        .map_err(Error::from)
        .add_msg(format!("Writing report log {path:?} failed"))?;
    Ok(path)
}

type Channel = Box<dyn Notification + Send + Sync>;

/// Ordered channels to notify. A method without a configured channel stays
/// in the list so it is reported rather than silently dropped.
pub struct Dispatcher {
    channels: Vec<(String, Option<Channel>)>,
}

impl Dispatcher {
    pub fn new(channels: Vec<(String, Option<Channel>)>) -> Self {
        Self { channels }
    }

    pub fn from_config(alerts: &AlertConfig) -> Self {
        Self::new(
            alerts
                .methods
                .iter()
                .map(|method| {
                    let channel = alerts
                        .channels
                        .get(method)
                        .map(|config| Box::new(config.clone()) as Channel);
                    (method.clone(), channel)
                })
                .collect(),
        )
    }

    /// Attempts every channel. Failures are logged and returned, never raised.
    /// `extra_recipients` reach every mailbox channel on top of its own list.
    pub fn dispatch(
        &self,
        subject: &str,
        body: &str,
        severity: Severity,
        extra_recipients: &[Mailbox],
    ) -> Vec<ChannelOutcome> {
        self.channels
            .iter()
            .map(|(method, channel)| {
                let result = match channel {
                    Some(channel) => channel.send_to(subject, body, severity, extra_recipients),
                    None => Err(Error::UnknownChannel(method.clone())),
                };
                match result {
                    Ok(()) => {
                        info!("Notification sent via {}", method);
                        ChannelOutcome {
                            method: method.clone(),
                            success: true,
                            diagnostic: "sent".to_string(),
                        }
                    }
                    Err(e) => {
                        let diagnostic = e.summary();
                        match e.root() {
                            Error::UnknownChannel(_) => {
                                warn!("Skipping unrecognized notification method {:?}", method)
                            }
                            _ => warn!("Notification via {} failed: {}", method, diagnostic),
                        }
                        ChannelOutcome {
                            method: method.clone(),
                            success: false,
                            diagnostic,
                        }
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::notifications::smtp::{SmtpMode, SmtpNotificationConfig};
    use crate::backup::notifications::webhook::tests::one_shot_server;
    use crate::backup::notifications::webhook::WebhookNotificationConfig;
    use crate::backup::notifications::NotificationConfig;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(host: &str, status: EntryStatus, secs: u64, detail: Option<&str>) -> ReportEntry {
        ReportEntry {
            host: host.into(),
            status,
            duration: Duration::from_secs(secs),
            mode: BackupMode::Full,
            detail: detail.map(str::to_string),
            notify: None,
        }
    }

    fn section<'a>(rendered: &'a str, title: &str) -> Vec<&'a str> {
        rendered
            .split("\n\n")
            .find(|block| block.lines().next() == Some(title))
            .map(|block| block.lines().skip(1).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3600), "1h 0m 0s");
        assert_eq!(format_duration(3661), "1h 1m 1s");
    }

    #[test]
    fn test_send_counts_and_sections() {
        let temp = TempDir::new().unwrap();
        let report = report_init("nightly");
        report.add(entry("h1", EntryStatus::Success, 45, None));
        report.add(entry("h2", EntryStatus::Failed, 12, Some("exit 1")));
        report.add(entry("h3", EntryStatus::Skipped, 0, None));

        let sent = report.send(temp.path(), &AlertConfig::default());
        assert_eq!(sent.summary, "1 succeeded, 1 failed, 1 skipped");
        assert!(sent.channels.is_empty());

        let log = std::fs::read_to_string(sent.log_path.unwrap()).unwrap();
        assert_eq!(log, sent.rendered);
        assert!(log.starts_with("Backup report: nightly\n"));
        assert!(log.contains("Summary: 1 succeeded, 1 failed, 1 skipped\n"));
        assert_eq!(section(&log, "FAILED"), vec!["  h2  12s  full  exit 1"]);
        assert_eq!(section(&log, "OK"), vec!["  h1  45s  full"]);
        assert_eq!(section(&log, "SKIP"), vec!["  h3  0s  full"]);
    }

    #[test]
    fn test_zero_counts_are_stated() {
        let temp = TempDir::new().unwrap();
        let report = report_init("empty");
        report.add(entry("h1", EntryStatus::Success, 1, None));

        let sent = report.send(temp.path(), &AlertConfig::default());
        assert_eq!(sent.summary, "1 succeeded, 0 failed, 0 skipped");
        assert_eq!(section(&sent.rendered, "FAILED"), vec!["  (none)"]);
    }

    #[test]
    fn test_log_name_is_date_stamped() {
        let temp = TempDir::new().unwrap();
        let sent = report_init("nightly").send(temp.path(), &AlertConfig::default());
        let name = sent
            .log_path
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        let today = Local::now().format("%Y-%m-%d").to_string();
        assert!(name.starts_with(&format!("report-nightly-{today}_")));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_concurrent_adds() {
        let report = Arc::new(report_init("parallel"));
        let handles = (0..8)
            .map(|i| {
                let report = report.clone();
                std::thread::spawn(move || {
                    report.add(entry(&format!("h{i}"), EntryStatus::Success, i, None))
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(report.counts().succeeded, 8);
    }

    fn alerts(channels: BTreeMap<String, NotificationConfig>, methods: &[&str]) -> AlertConfig {
        AlertConfig {
            enabled: true,
            methods: methods.iter().map(|m| m.to_string()).collect(),
            channels,
            ..AlertConfig::default()
        }
    }

    #[test]
    fn test_failing_channel_does_not_stop_others() {
        let temp = TempDir::new().unwrap();
        let (url, server) = one_shot_server(200);
        let mut channels = BTreeMap::new();
        channels.insert(
            "email".to_string(),
            NotificationConfig::Smtp(
                SmtpNotificationConfig::builder()
                    .host("127.0.0.1")
                    .port(1)
                    .smtp_mode(SmtpMode::Unsecured)
                    .from("backup@example.com".parse::<Mailbox>().unwrap())
                    .to(vec!["ops@example.com".parse::<Mailbox>().unwrap()])
                    .timeout(Duration::from_secs(2))
                    .build(),
            ),
        );
        channels.insert(
            "webhook".to_string(),
            NotificationConfig::Webhook(WebhookNotificationConfig::builder().url(url).build()),
        );

        let report = report_init("nightly");
        report.add(entry("h1", EntryStatus::Failed, 3, Some("exit 1")));
        let sent = report.send(temp.path(), &alerts(channels, &["email", "webhook"]));

        assert_eq!(sent.channels.len(), 2);
        assert_eq!(sent.channels[0].method, "email");
        assert!(!sent.channels[0].success);
        assert!(!sent.channels[0].diagnostic.is_empty());
        assert_eq!(sent.channels[1].method, "webhook");
        assert!(sent.channels[1].success);

        let request = server.join().unwrap();
        assert!(request.contains("\"severity\":\"error\""));
        assert!(request.contains("0 succeeded, 1 failed, 0 skipped"));
    }

    #[test]
    fn test_unknown_method_is_a_warning() {
        let temp = TempDir::new().unwrap();
        let report = report_init("nightly");
        report.add(entry("h1", EntryStatus::Success, 3, None));

        let sent = report.send(temp.path(), &alerts(BTreeMap::new(), &["pager"]));
        assert_eq!(
            sent.channels,
            vec![ChannelOutcome {
                method: "pager".into(),
                success: false,
                diagnostic: "unknown notification channel \"pager\"".into(),
            }]
        );
    }

    /// Records what each send was addressed to.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Notification for RecordingChannel {
        fn send(&self, subject: &str, body: &str, severity: Severity) -> Result<()> {
            self.send_to(subject, body, severity, &[])
        }

        fn send_to(
            &self,
            _subject: &str,
            _body: &str,
            _severity: Severity,
            extra_recipients: &[Mailbox],
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(extra_recipients.iter().map(|m| m.email.to_string()).collect());
            Ok(())
        }
    }

    #[test]
    fn test_host_recipients_join_fan_out() {
        let temp = TempDir::new().unwrap();
        let channel = RecordingChannel::default();
        let sent = channel.sent.clone();
        let dispatcher = Dispatcher::new(vec![("email".to_string(), Some(Box::new(channel) as Channel))]);

        let report = report_init("nightly");
        let dba = "dba@example.com".parse::<Mailbox>().ok();
        report.add(entry("db-01", EntryStatus::Failed, 3, Some("exit 1")).with_notify(dba.clone()));
        report.add(entry("db-02", EntryStatus::Success, 3, None).with_notify(dba));
        report.add(entry("web-01", EntryStatus::Success, 3, None));

        let summary = report.send_via(temp.path(), &alerts(BTreeMap::new(), &["email"]), &dispatcher);
        assert!(summary.channels[0].success);
        assert_eq!(*sent.lock().unwrap(), vec![vec!["dba@example.com".to_string()]]);
    }

    #[test]
    fn test_toggles_suppress_dispatch() {
        let temp = TempDir::new().unwrap();
        let report = report_init("nightly");
        report.add(entry("h1", EntryStatus::Success, 3, None));

        let mut config = alerts(BTreeMap::new(), &["pager"]);
        config.notify_on_success = false;
        assert!(report.send(temp.path(), &config).channels.is_empty());
    }

    #[test]
    fn test_outcome_to_entry() {
        let outcome = JobOutcome {
            host: "web-01".into(),
            mode: BackupMode::FilesOnly,
            status: JobStatus::Failed(Some("interrupted".into())),
            duration: Duration::from_secs(7),
        };
        let entry = ReportEntry::from(&outcome);
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.detail.as_deref(), Some("interrupted"));
        assert_eq!(entry.mode, BackupMode::FilesOnly);
    }
}
