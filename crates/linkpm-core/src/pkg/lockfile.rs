//! Lockfile documents.
//!
//! A project carries two lockfiles with the same schema:
//! - the public `linkpm-lock.json` at the project root, meant to be committed
//! - the private `node_modules/.linkpm-lock.json`, describing what is
//!   actually materialised in `node_modules`
//!
//! ```json
//! {
//!   "lockfileVersion": 1,
//!   "registry": "https://registry.npmjs.org/",
//!   "specifiers": { "foo": "^1.0.0" },
//!   "dependencies": { "foo": "1.0.0" },
//!   "packages": {
//!     "/foo/1.0.0": {
//!       "name": "foo",
//!       "version": "1.0.0",
//!       "resolution": { "type": "registry", "tarball": "...", "integrity": "sha512-..." },
//!       "dependencies": { "bar": "1.0.0" }
//!     }
//!   }
//! }
//! ```
//!
//! Every map is a `BTreeMap`, so serialisation is deterministic and a repeat
//! install writes byte-identical files.

use super::error::PkgError;
use super::package::{registry_package_id, Resolution, ResolvedPackage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Schema version of both lockfiles.
pub const LOCKFILE_VERSION: u32 = 1;

/// Public lockfile name, relative to the project root.
pub const LOCKFILE_NAME: &str = "linkpm-lock.json";

/// Private lockfile name, relative to `node_modules`.
pub const PRIVATE_LOCKFILE_NAME: &str = ".linkpm-lock.json";

/// Lockfile error codes.
pub mod codes {
    /// Lockfile has invalid JSON.
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile schema version mismatch.
    pub const PKG_LOCK_VERSION_MISMATCH: &str = "PKG_LOCK_VERSION_MISMATCH";
    /// Lockfile write failed.
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
}

/// How a locked package was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockResolution {
    Registry {
        tarball: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        integrity: Option<String>,
    },
    Directory {
        directory: PathBuf,
    },
    Git {
        repo: String,
        commit: String,
    },
}

impl From<&Resolution> for LockResolution {
    fn from(resolution: &Resolution) -> Self {
        match resolution {
            Resolution::Registry { tarball, integrity } => Self::Registry {
                tarball: tarball.clone(),
                integrity: integrity.clone(),
            },
            Resolution::Directory { directory } => Self::Directory {
                directory: directory.clone(),
            },
            Resolution::Git { repo, commit } => Self::Git {
                repo: repo.clone(),
                commit: commit.clone(),
            },
        }
    }
}

impl From<&LockResolution> for Resolution {
    fn from(resolution: &LockResolution) -> Self {
        match resolution {
            LockResolution::Registry { tarball, integrity } => Self::Registry {
                tarball: tarball.clone(),
                integrity: integrity.clone(),
            },
            LockResolution::Directory { directory } => Self::Directory {
                directory: directory.clone(),
            },
            LockResolution::Git { repo, commit } => Self::Git {
                repo: repo.clone(),
                commit: commit.clone(),
            },
        }
    }
}

/// A locked package entry.
///
/// `dependencies` maps child names to references: a version for registry
/// children, or a full `link:` id for local ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPackage {
    pub name: String,
    pub version: String,
    pub resolution: LockResolution,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    /// Only reachable through dev dependencies.
    #[serde(default, skip_serializing_if = "is_false")]
    pub dev: bool,
    /// Only reachable through optional dependencies.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_scripts: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !b
}

impl LockPackage {
    /// Lock entry for a resolved package whose children resolved to
    /// `children` (name -> package id).
    #[must_use]
    pub fn from_resolved(pkg: &ResolvedPackage, children: &BTreeMap<String, String>) -> Self {
        let reference = |name: &String| children.get(name).map(|id| reference_of(name, id));

        let dependencies = pkg
            .dependencies
            .keys()
            .filter(|name| !pkg.optional_dependencies.contains_key(*name))
            .filter_map(|name| reference(name).map(|r| (name.clone(), r)))
            .collect();
        let optional_dependencies = pkg
            .optional_dependencies
            .keys()
            .filter_map(|name| reference(name).map(|r| (name.clone(), r)))
            .collect();

        Self {
            name: pkg.name.clone(),
            version: pkg.version.clone(),
            resolution: LockResolution::from(&pkg.resolution),
            dependencies,
            optional_dependencies,
            dev: false,
            optional: false,
            has_scripts: pkg.has_scripts,
            engines: pkg.engines.clone(),
            os: pkg.os.clone(),
            cpu: pkg.cpu.clone(),
        }
    }

    /// Rebuild the resolved package this entry locks.
    ///
    /// Child references become exact dependency specs.
    #[must_use]
    pub fn to_resolved(&self, id: &str) -> ResolvedPackage {
        let mut dependencies = self.dependencies.clone();
        dependencies.extend(self.optional_dependencies.clone());

        ResolvedPackage {
            id: id.to_string(),
            name: self.name.clone(),
            version: self.version.clone(),
            resolution: Resolution::from(&self.resolution),
            dependencies,
            optional_dependencies: self.optional_dependencies.clone(),
            engines: self.engines.clone(),
            os: self.os.clone(),
            cpu: self.cpu.clone(),
            has_scripts: self.has_scripts,
        }
    }

    /// Child package ids, regular and optional.
    pub fn child_ids(&self) -> impl Iterator<Item = String> + '_ {
        self.dependencies
            .iter()
            .chain(&self.optional_dependencies)
            .map(|(name, reference)| dependency_id(name, reference))
    }
}

/// Package id a dependency reference points at.
#[must_use]
pub fn dependency_id(name: &str, reference: &str) -> String {
    if reference.starts_with("link:") || reference.starts_with('/') {
        reference.to_string()
    } else {
        registry_package_id(name, reference)
    }
}

/// The reference recorded for a child id.
#[must_use]
pub fn reference_of(name: &str, id: &str) -> String {
    match id.strip_prefix('/').and_then(|rest| rest.strip_prefix(name)) {
        Some(version) if version.starts_with('/') => version[1..].to_string(),
        _ => id.to_string(),
    }
}

/// A lockfile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub lockfile_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry: String,
    /// Root dependency specifiers as written in `package.json`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specifiers: BTreeMap<String, String>,
    /// Root production dependencies (name -> reference).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    /// All locked packages by package id.
    #[serde(default)]
    pub packages: BTreeMap<String, LockPackage>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new("")
    }
}

impl Lockfile {
    /// Create an empty lockfile.
    #[must_use]
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            lockfile_version: LOCKFILE_VERSION,
            registry: registry.into(),
            specifiers: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            packages: BTreeMap::new(),
        }
    }

    /// All root references, with `optionalDependencies` taking precedence
    /// over `dependencies` over `devDependencies`.
    #[must_use]
    pub fn root_references(&self) -> BTreeMap<String, String> {
        let mut all = self.dev_dependencies.clone();
        all.extend(self.dependencies.clone());
        all.extend(self.optional_dependencies.clone());
        all
    }

    /// Drop a root dependency from every section.
    pub fn remove_root(&mut self, name: &str) {
        self.specifiers.remove(name);
        self.dependencies.remove(name);
        self.dev_dependencies.remove(name);
        self.optional_dependencies.remove(name);
    }

    /// Read a lockfile. A missing file yields `None`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or has another
    /// schema version.
    pub fn read_from(path: &Path) -> Result<Option<Self>, LockfileError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Failed to read {}: {e}", path.display()),
                ))
            }
        };

        let lockfile = Self::from_json(&content)?;
        if lockfile.lockfile_version != LOCKFILE_VERSION {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_MISMATCH,
                format!(
                    "Lockfile version {} in {} not supported (expected {LOCKFILE_VERSION})",
                    lockfile.lockfile_version,
                    path.display()
                ),
            ));
        }

        Ok(Some(lockfile))
    }

    /// Serialize to the on-disk form.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, LockfileError> {
        let mut json = serde_json::to_string_pretty(self).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to serialize lockfile: {e}"),
            )
        })?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, LockfileError> {
        serde_json::from_str(json).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_INVALID_JSON,
                format!("Invalid lockfile JSON: {e}"),
            )
        })
    }
}

/// Path of the public lockfile.
#[must_use]
pub fn public_path(root: &Path) -> PathBuf {
    root.join(LOCKFILE_NAME)
}

/// Path of the private lockfile.
#[must_use]
pub fn private_path(root: &Path) -> PathBuf {
    root.join("node_modules").join(PRIVATE_LOCKFILE_NAME)
}

/// The public/private lockfile pair of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockfilePair {
    pub public: Lockfile,
    pub private: Lockfile,
    pub public_exists: bool,
    pub private_exists: bool,
}

/// Read both lockfiles. Missing files become empty lockfiles for `registry`.
///
/// # Errors
/// Returns an error if either file exists but is unreadable.
pub fn read_pair(root: &Path, registry: &str) -> Result<LockfilePair, LockfileError> {
    let public = Lockfile::read_from(&public_path(root))?;
    let private = Lockfile::read_from(&private_path(root))?;

    Ok(LockfilePair {
        public_exists: public.is_some(),
        private_exists: private.is_some(),
        public: public.unwrap_or_else(|| Lockfile::new(registry)),
        private: private.unwrap_or_else(|| Lockfile::new(registry)),
    })
}

/// Persist both lockfiles together.
///
/// Both documents are staged to temp files before either is renamed into
/// place.
///
/// # Errors
/// Returns an error if serialization or any write fails.
pub fn write_pair(root: &Path, public: &Lockfile, private: &Lockfile) -> Result<(), LockfileError> {
    let public_json = public.to_json()?;
    let private_json = private.to_json()?;
    let public_path = public_path(root);
    let private_path = private_path(root);

    linkpm_util::fs::atomic_write_all(&[
        (public_path.as_path(), public_json.as_bytes()),
        (private_path.as_path(), private_json.as_bytes()),
    ])
    .map_err(|e| {
        LockfileError::new(
            codes::PKG_LOCK_WRITE_FAILED,
            format!("Failed to write lockfiles in {}: {e}", root.display()),
        )
    })
}

/// Lockfile error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    /// Create a new error.
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
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}

impl From<LockfileError> for PkgError {
    fn from(err: LockfileError) -> Self {
        PkgError::new(err.code, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry_pkg(name: &str, version: &str) -> LockPackage {
        LockPackage {
            name: name.into(),
            version: version.into(),
            resolution: LockResolution::Registry {
                tarball: format!("https://r/{name}-{version}.tgz"),
                integrity: None,
            },
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            dev: false,
            optional: false,
            has_scripts: false,
            engines: BTreeMap::new(),
            os: Vec::new(),
            cpu: Vec::new(),
        }
    }

    #[test]
    fn test_dependency_id_and_reference() {
        assert_eq!(dependency_id("foo", "1.0.0"), "/foo/1.0.0");
        assert_eq!(dependency_id("@s/foo", "1.0.0"), "/@s/foo/1.0.0");
        assert_eq!(dependency_id("foo", "link:/tmp/foo"), "link:/tmp/foo");

        assert_eq!(reference_of("foo", "/foo/1.0.0"), "1.0.0");
        assert_eq!(reference_of("@s/foo", "/@s/foo/1.0.0"), "1.0.0");
        assert_eq!(reference_of("foo", "link:/tmp/foo"), "link:/tmp/foo");
        // An id for a different name is kept whole
        assert_eq!(reference_of("foo", "/foobar/1.0.0"), "/foobar/1.0.0");
    }

    #[test]
    fn test_read_missing_pair_is_empty() {
        let dir = tempdir().unwrap();
        let pair = read_pair(dir.path(), "https://r/").unwrap();
        assert!(!pair.public_exists);
        assert!(!pair.private_exists);
        assert_eq!(pair.public.registry, "https://r/");
        assert!(pair.private.packages.is_empty());
    }

    #[test]
    fn test_write_pair_roundtrip() {
        let dir = tempdir().unwrap();
        let mut lock = Lockfile::new("https://r/");
        lock.specifiers.insert("foo".into(), "^1.0.0".into());
        lock.dependencies.insert("foo".into(), "1.0.0".into());
        lock.packages.insert("/foo/1.0.0".into(), registry_pkg("foo", "1.0.0"));

        write_pair(dir.path(), &lock, &lock).unwrap();

        let pair = read_pair(dir.path(), "").unwrap();
        assert!(pair.public_exists && pair.private_exists);
        assert_eq!(pair.public, lock);
        assert_eq!(pair.private, lock);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let mut a = Lockfile::new("");
        a.packages.insert("/b/1.0.0".into(), registry_pkg("b", "1.0.0"));
        a.packages.insert("/a/1.0.0".into(), registry_pkg("a", "1.0.0"));

        let mut b = Lockfile::new("");
        b.packages.insert("/a/1.0.0".into(), registry_pkg("a", "1.0.0"));
        b.packages.insert("/b/1.0.0".into(), registry_pkg("b", "1.0.0"));

        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempdir().unwrap();
        fs::write(
            public_path(dir.path()),
            r#"{"lockfileVersion": 99, "packages": {}}"#,
        )
        .unwrap();
        let err = read_pair(dir.path(), "").unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_VERSION_MISMATCH);
    }

    #[test]
    fn test_resolved_roundtrip_keeps_child_references() {
        let pkg = ResolvedPackage {
            id: "/foo/1.0.0".into(),
            name: "foo".into(),
            version: "1.0.0".into(),
            resolution: Resolution::Registry {
                tarball: "t".into(),
                integrity: Some("sha512-x".into()),
            },
            dependencies: [("bar".to_string(), "^1.0.0".to_string()), ("opt".to_string(), "^2.0.0".to_string())]
                .into_iter()
                .collect(),
            optional_dependencies: [("opt".to_string(), "^2.0.0".to_string())].into_iter().collect(),
            engines: BTreeMap::new(),
            os: Vec::new(),
            cpu: Vec::new(),
            has_scripts: true,
        };
        let children = [
            ("bar".to_string(), "/bar/1.2.0".to_string()),
            ("opt".to_string(), "/opt/2.0.1".to_string()),
        ]
        .into_iter()
        .collect();

        let locked = LockPackage::from_resolved(&pkg, &children);
        assert_eq!(locked.dependencies["bar"], "1.2.0");
        assert!(!locked.dependencies.contains_key("opt"));
        assert_eq!(locked.optional_dependencies["opt"], "2.0.1");

        let back = locked.to_resolved("/foo/1.0.0");
        assert_eq!(back.dependencies["bar"], "1.2.0");
        assert_eq!(back.dependencies["opt"], "2.0.1");
        assert!(back.has_scripts);
        assert_eq!(
            locked.child_ids().collect::<Vec<_>>(),
            vec!["/bar/1.2.0".to_string(), "/opt/2.0.1".to_string()]
        );
    }
}
