pub mod config;
pub mod excludes;
pub mod job;
pub mod mode;
pub mod notifications;
pub mod redacted;
pub mod remote;
pub mod report;
pub mod result_error;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod transfer;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
