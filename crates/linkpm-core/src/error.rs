use crate::pkg::lockfile::LockfileError;
use crate::pkg::PkgError;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for linkpm operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    #[error("Failed to parse options at {path}: {source}")]
    OptionsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Stable error code for machine-readable output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO_ERROR",
            Self::Pkg(e) => e.code(),
            Self::Lockfile(e) => e.code(),
            Self::OptionsParse { .. } => "OPTIONS_INVALID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;

    #[test]
    fn test_pkg_error_keeps_code() {
        let err: Error = PkgError::lock_timeout("/tmp/project").into();
        assert_eq!(err.code(), codes::PKG_LOCK_TIMEOUT);
        assert!(err.to_string().starts_with("PKG_LOCK_TIMEOUT: "));
    }
}
