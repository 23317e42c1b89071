//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_DOWNLOAD_FAILED: &str = "PKG_DOWNLOAD_FAILED";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_LINK_FAILED: &str = "PKG_LINK_FAILED";
    pub const NODE_MODULES_WRITE_FAILED: &str = "NODE_MODULES_WRITE_FAILED";
    pub const PKG_STORE_ERROR: &str = "PKG_STORE_ERROR";
    pub const PKG_STORE_MISMATCH: &str = "PKG_STORE_MISMATCH";

    pub const PKG_ARGS_INVALID: &str = "PKG_ARGS_INVALID";
    pub const PKG_MANIFEST_MISSING: &str = "PKG_MANIFEST_MISSING";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";

    // Install engine
    pub const PKG_LOCK_TIMEOUT: &str = "PKG_LOCK_TIMEOUT";
    pub const PKG_ENGINE_MISMATCH: &str = "PKG_ENGINE_MISMATCH";
    pub const PKG_PLATFORM_MISMATCH: &str = "PKG_PLATFORM_MISMATCH";
    pub const PKG_LIFECYCLE_FAILED: &str = "PKG_LIFECYCLE_FAILED";
}

/// Package manager error.
///
/// `Clone` so one failure can be observed by every caller sharing a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error means a spec could not be resolved.
    #[must_use]
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self.code,
            codes::PKG_NOT_FOUND | codes::PKG_VERSION_NOT_FOUND | codes::PKG_REGISTRY_ERROR
        )
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Create a version not found error.
    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::new(
            codes::PKG_VERSION_NOT_FOUND,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    /// Create a registry error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    /// Create a download failed error.
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_DOWNLOAD_FAILED, msg)
    }

    /// Create an extraction failed error.
    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_EXTRACT_FAILED, msg)
    }

    /// Create an integrity mismatch error.
    #[must_use]
    pub fn integrity_mismatch(pkg_id: &str, expected: &str, actual: &str) -> Self {
        Self::new(
            codes::PKG_INTEGRITY_MISMATCH,
            format!("Integrity check failed for {pkg_id}: expected {expected}, got {actual}"),
        )
    }

    /// Create a link failed error.
    pub fn link_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LINK_FAILED, msg)
    }

    /// Create a `node_modules` write failed error.
    pub fn node_modules_write_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::NODE_MODULES_WRITE_FAILED, msg)
    }

    /// Create a store error.
    pub fn store_error(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_STORE_ERROR, msg)
    }

    /// Create a store mismatch error.
    #[must_use]
    pub fn store_mismatch(used: &std::path::Path, requested: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_STORE_MISMATCH,
            format!(
                "node_modules was installed with store {}, refusing to use {} (pass --force to reinstall)",
                used.display(),
                requested.display()
            ),
        )
    }

    /// Create an args invalid error.
    pub fn args_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_ARGS_INVALID, msg)
    }

    /// Create a manifest missing error.
    #[must_use]
    pub fn manifest_missing(dir: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_MANIFEST_MISSING,
            format!("No package.json found in {}", dir.display()),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    /// Create a run lock timeout error.
    #[must_use]
    pub fn lock_timeout(path: impl fmt::Display) -> Self {
        Self::new(
            codes::PKG_LOCK_TIMEOUT,
            format!("Timed out waiting for the lock on {path}"),
        )
    }

    /// Create an engine mismatch error.
    pub fn engine_mismatch(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_ENGINE_MISMATCH, msg)
    }

    /// Create a platform mismatch error.
    pub fn platform_mismatch(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PLATFORM_MISMATCH, msg)
    }

    /// Create a lifecycle script failure.
    #[must_use]
    pub fn lifecycle_failed(pkg_id: &str, event: &str, detail: &str) -> Self {
        Self::new(
            codes::PKG_LIFECYCLE_FAILED,
            format!("{pkg_id} {event}: {detail}"),
        )
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::PKG_STORE_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::PKG_REGISTRY_ERROR, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, format!("Invalid JSON: {e}"))
    }
}
