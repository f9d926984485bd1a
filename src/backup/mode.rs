use crate::backup::result_error::error::Error;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What a host job captures.
#[derive(Clone, Copy, Debug, Default, Display, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMode {
    #[default]
    #[display("full")]
    Full,
    #[display("files-only")]
    FilesOnly,
    #[display("db-only")]
    DbOnly,
}

impl BackupMode {
    pub fn includes_files(self) -> bool {
        !matches!(self, BackupMode::DbOnly)
    }

    pub fn includes_db(self) -> bool {
        !matches!(self, BackupMode::FilesOnly)
    }
}

impl FromStr for BackupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupMode::Full),
            "files-only" => Ok(BackupMode::FilesOnly),
            "db-only" => Ok(BackupMode::DbOnly),
            other => Err(Error::InvalidArgument(format!("unknown backup mode {other:?}"))),
        }
    }
}

/// Database engines the remote dump script knows how to dump.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    #[display("mysql")]
    Mysql,
    #[display("postgres")]
    Postgres,
    #[display("mongodb")]
    Mongodb,
    #[display("redis")]
    Redis,
    #[display("sqlite")]
    Sqlite,
}
