//! Resolved package identities.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a package's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A registry tarball.
    Registry {
        tarball: String,
        /// Subresource integrity (`sha512-...`) or a hex sha1 shasum.
        integrity: Option<String>,
    },
    /// A package directory on the local filesystem.
    Directory { directory: PathBuf },
    /// A git repository at a fixed commit.
    Git { repo: String, commit: String },
}

/// A package resolved to an exact identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// Stable id, `/<name>/<version>` or `link:<path>`.
    pub id: String,
    pub name: String,
    pub version: String,
    pub resolution: Resolution,
    /// Declared dependency ranges (name -> range).
    pub dependencies: BTreeMap<String, String>,
    /// Declared optional dependency ranges. Also present in `dependencies`.
    pub optional_dependencies: BTreeMap<String, String>,
    pub engines: BTreeMap<String, String>,
    pub os: Vec<String>,
    pub cpu: Vec<String>,
    /// Declares `preinstall`, `install` or `postinstall`.
    pub has_scripts: bool,
}

impl ResolvedPackage {
    /// Whether the content is a local directory that is linked, not fetched.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.resolution, Resolution::Directory { .. })
    }
}

/// Package id of a registry package.
#[must_use]
pub fn registry_package_id(name: &str, version: &str) -> String {
    format!("/{name}/{version}")
}

/// Package id of a local directory package.
#[must_use]
pub fn local_package_id(dir: &std::path::Path) -> String {
    format!("link:{}", dir.display())
}

/// Split a registry package id back into name and version.
#[must_use]
pub fn parse_package_id(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix('/')?;
    let (name, version) = rest.rsplit_once('/')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_id_roundtrip_scoped() {
        let id = registry_package_id("@types/node", "20.1.0");
        assert_eq!(id, "/@types/node/20.1.0");
        assert_eq!(parse_package_id(&id), Some(("@types/node", "20.1.0")));
    }

    #[test]
    fn test_parse_rejects_local_ids() {
        assert_eq!(parse_package_id("link:/tmp/foo"), None);
        assert_eq!(parse_package_id("/foo"), None);
    }
}
