//! Custom validator functions for configuration values.

use sanitize_filename::{is_sanitized, sanitize};
use std::path::Path;
use validator::ValidationError;

/// Host names end up in file names (`proc-<host>.state`, `exclude.<host>.conf`)
/// and in snapshot paths, so they have to be safe file names.
pub fn validate_host_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || name.starts_with('.') || name.contains(char::is_whitespace) {
        return Err(ValidationError::new("InvalidHostName")
            .with_message(format!("Invalid host name {name:?}").into()));
    }
    if !is_sanitized(name) {
        return Err(ValidationError::new("InvalidHostName").with_message(
            format!("Invalid host name {name:?}, try sanitizing like {:?}", sanitize(name)).into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory")
                .with_message(format!("cannot create or access {:?}: {}", dir, e).into())
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_absolute_remote_path<S: AsRef<str>>(path: S) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if !path.starts_with('/') || path.contains('\0') || path.contains('\n') {
        return Err(ValidationError::new("InvalidRemotePath")
            .with_message(format!("{path:?} must be an absolute path").into()));
    }

    Ok(())
}
