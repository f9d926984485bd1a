pub mod rsync;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::bon;
use getset::Getters;
use std::ffi::OsString;
use std::path::PathBuf;

/// Options the builder sets itself; extra options must not override them.
const RESERVED_OPTIONS: &[&str] = &[
    "--link-dest",
    "--exclude",
    "--exclude-from",
    "--include",
    "--include-from",
    "--filter",
    "--rsh",
    "-e",
];

/// A validated rsync invocation.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RsyncArgs {
    /// `user@address` for remote sources, `None` for local ones.
    remote: Option<String>,
    sources: Vec<String>,
    destination: PathBuf,
    remote_shell: Option<String>,
    filters: Vec<String>,
    link_dest: Option<PathBuf>,
    bandwidth_limit: Option<u32>,
    extra_options: Vec<String>,
}

#[bon]
impl RsyncArgs {
    #[builder]
    pub fn new(
        #[builder(into)] remote: Option<String>,
        sources: Vec<String>,
        #[builder(into)] destination: PathBuf,
        #[builder(into)] remote_shell: Option<String>,
        #[builder(default)] filters: Vec<String>,
        #[builder(into)] link_dest: Option<PathBuf>,
        bandwidth_limit: Option<u32>,
        #[builder(default)] extra_options: Vec<String>,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidArgument("rsync needs at least one source".into()));
        }
        if let Some(source) = sources.iter().find(|s| s.is_empty() || s.contains('\0')) {
            return Err(Error::InvalidArgument(format!("invalid rsync source {source:?}")));
        }
        if bandwidth_limit == Some(0) {
            return Err(Error::InvalidArgument(
                "bandwidth limit must be greater than zero".into(),
            ));
        }
        extra_options.iter().try_for_each(|o| validate_extra_option(o))?;

        Ok(Self {
            remote,
            sources,
            destination,
            remote_shell,
            filters,
            link_dest,
            bandwidth_limit,
            extra_options,
        })
    }

    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--archive",
            "--hard-links",
            "--acls",
            "--xattrs",
            "--numeric-ids",
            "--delete",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        if let Some(shell) = &self.remote_shell {
            args.push("-e".into());
            args.push(shell.into());
        }
        if let Some(limit) = self.bandwidth_limit {
            args.push(format!("--bwlimit={limit}").into());
        }
        if let Some(link_dest) = &self.link_dest {
            let mut arg = OsString::from("--link-dest=");
            arg.push(link_dest);
            args.push(arg);
        }
        // rsync stops at the first matching rule, so the last pattern goes first.
        args.extend(self.filters.iter().rev().map(|f| filter_arg(f)));
        args.extend(self.extra_options.iter().map(OsString::from));
        if self.sources.len() > 1 {
            args.push("--relative".into());
        }
        args.extend(self.sources.iter().map(|s| match &self.remote {
            Some(remote) => OsString::from(format!("{remote}:{s}")),
            None => OsString::from(s),
        }));
        args.push(self.destination.join("").into_os_string());
        args
    }
}

/// `+ pattern` and `!pattern` re-include, anything else excludes.
fn filter_arg(pattern: &str) -> OsString {
    if let Some(rest) = pattern.strip_prefix("+ ").or_else(|| pattern.strip_prefix('!')) {
        format!("--include={}", rest.trim_start()).into()
    } else if let Some(rest) = pattern.strip_prefix("- ") {
        format!("--exclude={}", rest.trim_start()).into()
    } else {
        format!("--exclude={pattern}").into()
    }
}

fn validate_extra_option(option: &str) -> Result<()> {
    if !option.starts_with('-') || option == "-" || option == "--" {
        return Err(Error::InvalidArgument(format!(
            "extra rsync option {option:?} is not a flag"
        )));
    }
    if option.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(Error::InvalidArgument(format!(
            "extra rsync option {option:?} contains whitespace"
        )));
    }
    let name = option.split('=').next().unwrap_or(option);
    if RESERVED_OPTIONS.contains(&name) || (name.starts_with("-e") && !name.starts_with("--")) {
        return Err(Error::InvalidArgument(format!(
            "extra rsync option {option:?} overrides a managed option"
        )));
    }
    Ok(())
}

pub trait Transfer: Send + Sync {
    fn transfer(&self, args: &RsyncArgs) -> Result<()>;
}
