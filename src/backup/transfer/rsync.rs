use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::transfer::{RsyncArgs, Transfer};
use function_name::named;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// "Partial transfer due to vanished source files": files disappeared on a
/// live system between listing and copying.
const RSYNC_VANISHED: i32 = 24;

pub struct RsyncTransfer {
    binary: PathBuf,
}

impl RsyncTransfer {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Transfer for RsyncTransfer {
    #[named]
    fn transfer(&self, args: &RsyncArgs) -> Result<()> {
        info!(
            "rsync {:?} -> {:?}",
            args.sources(),
            args.destination()
        );
        std::fs::create_dir_all(args.destination())
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let output = Command::new(&self.binary)
            .args(args.to_args())
            .stdin(Stdio::null())
            .output()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(RSYNC_VANISHED) => {
                warn!("Some source files vanished during transfer to {:?}", args.destination());
                Ok(())
            }
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = stderr
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .last()
                    .unwrap_or("no diagnostic");
                Err(Error::TransferFailed(format!("rsync exit {code}: {reason}")))
            }
            None => Err(Error::TransferFailed("rsync killed by signal".into())),
        }
    }
}
