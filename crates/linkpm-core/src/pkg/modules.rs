//! `node_modules/.modules.json`: metadata about the installed layout.

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Metadata filename, relative to `node_modules`.
pub const MODULES_FILE: &str = ".modules.json";

/// Version of the `node_modules` layout.
pub const LAYOUT_VERSION: u32 = 1;

/// What the last successful run left in `node_modules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulesMeta {
    /// `linkpm@<version>` that wrote the layout.
    pub package_manager: String,
    /// Store the layout links into.
    pub store: PathBuf,
    /// Package ids excluded from installation, sorted.
    #[serde(default)]
    pub skipped: Vec<String>,
    pub layout_version: u32,
    #[serde(default)]
    pub independent_leaves: bool,
}

/// Read `.modules.json`. A missing file yields `None`.
///
/// # Errors
/// Returns an error if the file exists but cannot be parsed.
pub fn read_modules(node_modules: &Path) -> Result<Option<ModulesMeta>, PkgError> {
    let path = node_modules.join(MODULES_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content).map(Some).map_err(|e| {
        PkgError::store_error(format!("Invalid {}: {e}", path.display()))
    })
}

/// Write `.modules.json` atomically.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_modules(node_modules: &Path, meta: &ModulesMeta) -> Result<(), PkgError> {
    let mut meta = meta.clone();
    meta.skipped.sort();
    meta.skipped.dedup();

    let mut json = serde_json::to_string_pretty(&meta)?;
    json.push('\n');

    linkpm_util::fs::atomic_write(&node_modules.join(MODULES_FILE), json.as_bytes()).map_err(|e| {
        PkgError::node_modules_write_failed(format!(
            "Failed to write {}: {e}",
            node_modules.join(MODULES_FILE).display()
        ))
    })
}
