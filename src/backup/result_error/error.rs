use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error(transparent)]
    EmailBuild(#[from] lettre::error::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("smtp server rejected message: {0}")]
    SmtpSend(String),
    #[error("host {host} is locked by running job (pid {pid})")]
    LockContention { host: String, pid: u32 },
    #[error("remote host {host} unreachable: {detail}")]
    RemoteUnreachable { host: String, detail: String },
    #[error("database dump on {host} did not finish within {waited:?}")]
    DumpTimeout { host: String, waited: Duration },
    #[error("database dump on {host} failed: {detail}")]
    DumpFailed { host: String, detail: String },
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("cannot rotate {path:?}: {source}")]
    RotationIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("notification channel {method} failed: {detail}")]
    NotificationChannel { method: String, detail: String },
    #[error("unknown notification channel {0:?}")]
    UnknownChannel(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("interrupted")]
    Interrupted,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { error: Box<Error>, fn_name: String },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            error: Box::new(self),
            fn_name: fn_name.into(),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        Self::lots_of_error(errors)
    }
}

impl Error {
    pub fn lots_of_error(errors: Vec<Error>) -> Self {
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }

    pub fn smtp_send_error<S: Into<String>>(msg: S) -> Self {
        Self::SmtpSend(msg.into())
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    /// Innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.root(),
            e => e,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.root(), Error::Interrupted)
    }

    /// Single line rendering used for state records and report entries.
    pub fn summary(&self) -> String {
        match self {
            Error::WithMsg { msg, error } => format!("{msg}: {}", error.summary()),
            Error::WithFnName { error, .. } => error.summary(),
            Error::LotsOfError(v) => v.iter().map(Error::summary).join("; "),
            e => e.to_string().lines().map(str::trim).join(" "),
        }
    }
}
