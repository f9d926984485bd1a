use crate::backup::config::{DumpSettings, SshSettings};
use crate::backup::function_path;
use crate::backup::mode::DbType;
use crate::backup::remote::{DumpStatus, RemoteExecutor, RemoteTarget};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use function_name::named;
use itertools::Itertools;
use std::ffi::OsString;
use std::process::{Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const STARTED_MARKER: &str = ".dump_started";
const DONE_MARKER: &str = ".dump_done";
const FAILED_MARKER: &str = ".dump_failed";
const PID_FILE: &str = ".dump_pid";
const LOG_FILE: &str = ".dump_log";

/// Exit status ssh itself uses for connection and authentication errors.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Runs the remote dump script over the system `ssh` binary.
///
/// The script is wrapped so the marker files are written regardless of what
/// the script itself does: `.dump_started` before it runs, then `.dump_done`
/// or `.dump_failed` (holding the exit status and last log line).
pub struct SshExecutor {
    ssh: SshSettings,
    dump: DumpSettings,
}

impl SshExecutor {
    pub fn new(ssh: &SshSettings, dump: &DumpSettings) -> Self {
        Self {
            ssh: ssh.clone(),
            dump: dump.clone(),
        }
    }

    fn command_args(&self, target: &RemoteTarget, remote_command: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout.as_secs().max(1)).into(),
            "-p".into(),
            target.port.to_string().into(),
        ];
        if let Some(identity) = &self.ssh.identity_file {
            args.push("-i".into());
            args.push(identity.into());
        }
        args.push(format!("{}@{}", target.user, target.address).into());
        args.push(remote_command.into());
        args
    }

    #[named]
    fn run(&self, target: &RemoteTarget, remote_command: &str) -> Result<Output> {
        debug!("ssh {}: {}", target.name, remote_command);
        let output = Command::new(&self.ssh.binary)
            .args(self.command_args(target, remote_command))
            .stdin(Stdio::null())
            .output()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        match output.status.code() {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(Error::RemoteUnreachable {
                host: target.name.clone(),
                detail: last_line(&output.stderr).unwrap_or_else(|| output.status.to_string()),
            }),
            Some(_) => Ok(output),
        }
    }

    fn start_command(&self, db_types: &[DbType]) -> String {
        let dir = shell_quote(&self.dump.remote_dir);
        let wrapper = format!(
            "touch \"$1/{STARTED_MARKER}\"; \
             if \"$2\" --types \"$3\" --out \"$1\" >\"$1/{LOG_FILE}\" 2>&1; \
             then touch \"$1/{DONE_MARKER}\"; \
             else echo \"exit $? $(tail -n 1 \"$1/{LOG_FILE}\")\" >\"$1/{FAILED_MARKER}\"; fi"
        );
        // Only the nohup command goes to the background. Backgrounding the whole
        // list would keep the session's stdout open until the dump ends.
        format!(
            "d={dir}; mkdir -p \"$d\" && \
             rm -f \"$d/{STARTED_MARKER}\" \"$d/{DONE_MARKER}\" \"$d/{FAILED_MARKER}\" \"$d/{PID_FILE}\" \
             || exit 1; \
             nohup sh -c {wrapper} tm-dump \"$d\" {script} {types} >/dev/null 2>&1 </dev/null & \
             echo $! >\"$d/{PID_FILE}\"",
            wrapper = shell_quote(&wrapper),
            script = shell_quote(&self.dump.remote_script),
            types = shell_quote(&db_types.iter().join(",")),
        )
    }

    fn started_probe_command(&self) -> String {
        format!(
            "d={}; test -e \"$d/{STARTED_MARKER}\" -o -e \"$d/{DONE_MARKER}\" -o -e \"$d/{FAILED_MARKER}\"",
            shell_quote(&self.dump.remote_dir)
        )
    }

    fn poll_command(&self) -> String {
        format!(
            "d={}; if [ -e \"$d/{FAILED_MARKER}\" ]; then echo failed; cat \"$d/{FAILED_MARKER}\"; \
             elif [ -e \"$d/{DONE_MARKER}\" ]; then echo success; \
             elif [ -e \"$d/{STARTED_MARKER}\" ]; then echo running; \
             else echo missing; fi",
            shell_quote(&self.dump.remote_dir)
        )
    }

    fn cancel_command(&self) -> String {
        format!(
            "d={}; if [ -f \"$d/{PID_FILE}\" ]; then pid=$(cat \"$d/{PID_FILE}\"); \
             pkill -P \"$pid\"; kill \"$pid\"; fi 2>/dev/null; \
             echo cancelled >\"$d/{FAILED_MARKER}\"",
            shell_quote(&self.dump.remote_dir)
        )
    }
}

impl RemoteExecutor for SshExecutor {
    #[named]
    fn start(&self, target: &RemoteTarget, db_types: &[DbType]) -> Result<()> {
        let output = self.run(target, &self.start_command(db_types))?;
        if !output.status.success() {
            return Err(Error::DumpFailed {
                host: target.name.clone(),
                detail: format!(
                    "dump launch exited with {}: {}",
                    output.status,
                    last_line(&output.stderr).unwrap_or_default()
                ),
            }
            .add_fn_name(function_path!()));
        }

        let deadline = Instant::now() + self.dump.start_timeout;
        let probe = self.started_probe_command();
        loop {
            if self.run(target, &probe)?.status.success() {
                info!("Dump process started on {}", target.name);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::DumpFailed {
                    host: target.name.clone(),
                    detail: format!("no start marker after {:?}", self.dump.start_timeout),
                }
                .add_fn_name(function_path!()));
            }
            sleep(Duration::from_secs(1).min(self.dump.start_timeout));
        }
    }

    fn poll(&self, target: &RemoteTarget) -> Result<DumpStatus> {
        let output = self.run(target, &self.poll_command())?;
        parse_poll_output(&target.name, &String::from_utf8_lossy(&output.stdout))
    }

    fn cancel(&self, target: &RemoteTarget) -> Result<()> {
        info!("Cancelling dump on {}", target.name);
        self.run(target, &self.cancel_command()).map(|_| ())
    }
}

fn parse_poll_output(host: &str, stdout: &str) -> Result<DumpStatus> {
    let mut lines = stdout.lines();
    match lines.next().map(str::trim) {
        Some("running") => Ok(DumpStatus::Running),
        Some("success") => Ok(DumpStatus::Succeeded),
        Some("failed") => {
            let detail = lines.map(str::trim).filter(|l| !l.is_empty()).join(" ");
            Ok(DumpStatus::Failed(if detail.is_empty() {
                "unknown error".into()
            } else {
                detail
            }))
        }
        Some("missing") => Ok(DumpStatus::Failed("dump markers disappeared".into())),
        other => Err(Error::RemoteUnreachable {
            host: host.to_string(),
            detail: format!("unexpected poll output {:?}", other.unwrap_or_default()),
        }),
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The `-e` value rsync needs to reach `target` the same way the executor does.
pub fn remote_shell(ssh: &SshSettings, target: &RemoteTarget) -> String {
    let mut parts = vec![
        shell_quote(&ssh.binary.to_string_lossy()),
        "-o BatchMode=yes".to_string(),
        format!("-o ConnectTimeout={}", ssh.connect_timeout.as_secs().max(1)),
        format!("-p {}", target.port),
    ];
    if let Some(identity) = &ssh.identity_file {
        parts.push(format!("-i {}", shell_quote(&identity.to_string_lossy())));
    }
    parts.join(" ")
}
