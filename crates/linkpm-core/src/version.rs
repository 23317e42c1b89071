use std::fmt::Write;

/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for store and cache directories.
/// Bump this when changing formats that would break compatibility.
pub const SCHEMA_VERSION: u32 = 1;

/// Identifier recorded in module-store metadata, e.g. `linkpm@0.2.0`.
#[must_use]
pub fn package_manager_id() -> String {
    format!("linkpm@{VERSION}")
}

/// Version line printed by `linkpm version`.
#[must_use]
pub fn version_string() -> String {
    let mut s = format!("linkpm {VERSION}");

    if let Some(hash) = option_env!("LINKPM_BUILD_GIT_HASH") {
        let _ = write!(s, " ({hash})");
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_package_manager_id_contains_version() {
        let id = package_manager_id();
        assert!(id.starts_with("linkpm@"));
        assert!(id.ends_with(VERSION));
    }

    #[test]
    fn test_version_string_names_binary() {
        assert!(version_string().starts_with(&format!("linkpm {VERSION}")));
    }

    #[test]
    fn test_schema_version_positive() {
        const { assert!(SCHEMA_VERSION > 0) };
    }
}
