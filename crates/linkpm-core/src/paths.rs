use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Environment variable to override the package store location.
pub const STORE_DIR_ENV: &str = "LINKPM_STORE_DIR";

/// Find the project root by walking up from `cwd` looking for `package.json`.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the shared package store directory.
///
/// Respects `LINKPM_STORE_DIR`. Otherwise uses platform-appropriate locations:
/// - Linux: `$XDG_CACHE_HOME/linkpm/v{N}/store` or `~/.cache/linkpm/v{N}/store`
/// - macOS: `~/Library/Caches/linkpm/v{N}/store`
/// - Windows: `%LOCALAPPDATA%\linkpm\v{N}\store`
#[must_use]
pub fn store_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STORE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".linkpm-cache"),
                |p| p.join(".cache").join("linkpm"),
            )
        },
        |p| p.join("linkpm"),
    );

    base.join(format!("v{SCHEMA_VERSION}")).join("store")
}

/// Directory holding project dependencies.
#[must_use]
pub fn node_modules(prefix: &Path) -> PathBuf {
    prefix.join("node_modules")
}
