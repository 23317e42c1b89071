//! Reading and writing `package.json`.

use super::error::PkgError;
use super::spec::PackageSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Manifest filename.
pub const MANIFEST_NAME: &str = "package.json";

/// Lifecycle events that make a package need a post-install run.
pub const INSTALL_EVENTS: [&str; 3] = ["preinstall", "install", "postinstall"];

/// Dependency section of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveType {
    Dependencies,
    DevDependencies,
    OptionalDependencies,
}

impl SaveType {
    /// Pick the section from `--save-dev` / `--save-optional`.
    ///
    /// `None` means "keep whatever section the dependency already lives in".
    #[must_use]
    pub fn from_flags(save_dev: bool, save_optional: bool) -> Option<Self> {
        if save_dev {
            Some(Self::DevDependencies)
        } else if save_optional {
            Some(Self::OptionalDependencies)
        } else {
            None
        }
    }
}

/// The subset of `package.json` the installer reads, plus everything else
/// kept verbatim so a rewrite does not drop unknown fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    /// All declared dependencies by name.
    ///
    /// When a name appears in several sections, `optionalDependencies` wins
    /// over `dependencies`, which wins over `devDependencies`.
    #[must_use]
    pub fn all_dependencies(&self) -> BTreeMap<String, String> {
        let mut all = self.dev_dependencies.clone();
        all.extend(self.dependencies.clone());
        all.extend(self.optional_dependencies.clone());
        all
    }

    /// Specs for every declared dependency, flagged dev/optional by section.
    ///
    /// # Errors
    /// Returns an error if a dependency name is invalid.
    pub fn specs(&self, where_dir: &Path) -> Result<Vec<PackageSpec>, PkgError> {
        self.all_dependencies()
            .iter()
            .map(|(name, range)| {
                PackageSpec::from_dependency(name, range, where_dir).map(|spec| {
                    spec.with_flags(
                        self.dev_dependencies.contains_key(name),
                        self.optional_dependencies.contains_key(name),
                    )
                })
            })
            .collect()
    }

    /// Whether the package declares any install-time lifecycle script.
    #[must_use]
    pub fn has_install_scripts(&self) -> bool {
        INSTALL_EVENTS.iter().any(|e| self.scripts.contains_key(*e))
    }

    /// Executables declared under `bin`, by command name.
    ///
    /// A string `bin` is named after the package, without its scope.
    #[must_use]
    pub fn bin_entries(&self) -> BTreeMap<String, String> {
        match self.extra.get("bin") {
            Some(serde_json::Value::String(path)) => self
                .name
                .as_deref()
                .map(|name| name.rsplit('/').next().unwrap_or(name))
                .filter(|name| !name.is_empty())
                .map(|name| BTreeMap::from([(name.to_string(), path.clone())]))
                .unwrap_or_default(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .filter_map(|(cmd, path)| Some((cmd.clone(), path.as_str()?.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    fn section_mut(&mut self, save_type: SaveType) -> &mut BTreeMap<String, String> {
        match save_type {
            SaveType::Dependencies => &mut self.dependencies,
            SaveType::DevDependencies => &mut self.dev_dependencies,
            SaveType::OptionalDependencies => &mut self.optional_dependencies,
        }
    }

    fn section_of(&self, name: &str) -> Option<SaveType> {
        if self.dependencies.contains_key(name) {
            Some(SaveType::Dependencies)
        } else if self.dev_dependencies.contains_key(name) {
            Some(SaveType::DevDependencies)
        } else if self.optional_dependencies.contains_key(name) {
            Some(SaveType::OptionalDependencies)
        } else {
            None
        }
    }

    /// Record `name: spec`.
    ///
    /// With an explicit section the dependency moves there; otherwise it
    /// stays in the section it already occupies (`dependencies` if new).
    pub fn save_dependency(&mut self, name: &str, spec: &str, save_type: Option<SaveType>) {
        match save_type {
            Some(target) => {
                for other in [
                    SaveType::Dependencies,
                    SaveType::DevDependencies,
                    SaveType::OptionalDependencies,
                ] {
                    if other != target {
                        self.section_mut(other).remove(name);
                    }
                }
                self.section_mut(target)
                    .insert(name.to_string(), spec.to_string());
            }
            None => {
                let target = self.section_of(name).unwrap_or(SaveType::Dependencies);
                self.section_mut(target)
                    .insert(name.to_string(), spec.to_string());
            }
        }
    }

    /// Remove a dependency from one section, or from all of them.
    pub fn remove_dependency(&mut self, name: &str, save_type: Option<SaveType>) {
        match save_type {
            Some(target) => {
                self.section_mut(target).remove(name);
            }
            None => {
                self.dependencies.remove(name);
                self.dev_dependencies.remove(name);
                self.optional_dependencies.remove(name);
            }
        }
    }
}

/// Read `package.json` from a directory.
///
/// Returns `Ok(None)` when the file does not exist.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_manifest(dir: &Path) -> Result<Option<Manifest>, PkgError> {
    let path = dir.join(MANIFEST_NAME);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PkgError::package_json_invalid(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        }
    };

    serde_json::from_str(&content).map(Some).map_err(|e| {
        PkgError::package_json_invalid(format!("Invalid JSON in {}: {e}", path.display()))
    })
}

/// Write `package.json` atomically.
///
/// # Errors
/// Returns an error if the manifest cannot be serialized or written.
pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), PkgError> {
    let mut content = serde_json::to_string_pretty(manifest)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to serialize: {e}")))?;
    content.push('\n');

    linkpm_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
        PkgError::package_json_invalid(format!("Failed to write {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(json: &str) -> Manifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(read_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_read_invalid_json() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "{not json").unwrap();
        let err = read_manifest(dir.path()).unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_PACKAGE_JSON_INVALID);
    }

    #[test]
    fn test_roundtrip_keeps_unknown_fields() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_NAME),
            r#"{"name":"app","license":"MIT","dependencies":{"foo":"^1.0.0"}}"#,
        )
        .unwrap();

        let mut m = read_manifest(dir.path()).unwrap().unwrap();
        m.save_dependency("bar", "^2.0.0", None);
        write_manifest(&dir.path().join(MANIFEST_NAME), &m).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(MANIFEST_NAME)).unwrap())
                .unwrap();
        assert_eq!(raw["license"], "MIT");
        assert_eq!(raw["dependencies"]["bar"], "^2.0.0");
    }

    #[test]
    fn test_all_dependencies_precedence() {
        let m = manifest(
            r#"{
                "dependencies": {"a": "1.0.0"},
                "devDependencies": {"a": "2.0.0", "b": "1.0.0"},
                "optionalDependencies": {"a": "3.0.0"}
            }"#,
        );
        let all = m.all_dependencies();
        assert_eq!(all["a"], "3.0.0");
        assert_eq!(all["b"], "1.0.0");
    }

    #[test]
    fn test_specs_flags() {
        let m = manifest(
            r#"{
                "dependencies": {"a": "^1.0.0"},
                "devDependencies": {"b": "^1.0.0"},
                "optionalDependencies": {"c": "^1.0.0"}
            }"#,
        );
        let specs = m.specs(Path::new("/p")).unwrap();
        let by_name = |n: &str| specs.iter().find(|s| s.name == n).unwrap().clone();

        assert!(!by_name("a").dev && !by_name("a").optional);
        assert!(by_name("b").dev);
        assert!(by_name("c").optional);
    }

    #[test]
    fn test_save_with_section_moves_dependency() {
        let mut m = manifest(r#"{"dependencies": {"a": "^1.0.0"}}"#);
        m.save_dependency("a", "^1.1.0", Some(SaveType::DevDependencies));
        assert!(!m.dependencies.contains_key("a"));
        assert_eq!(m.dev_dependencies["a"], "^1.1.0");
    }

    #[test]
    fn test_save_without_section_keeps_existing() {
        let mut m = manifest(r#"{"optionalDependencies": {"a": "^1.0.0"}}"#);
        m.save_dependency("a", "^1.2.0", None);
        assert_eq!(m.optional_dependencies["a"], "^1.2.0");
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn test_remove_dependency_everywhere() {
        let mut m = manifest(
            r#"{"dependencies": {"a": "1"}, "devDependencies": {"a": "1", "b": "1"}}"#,
        );
        m.remove_dependency("a", None);
        assert!(m.all_dependencies().get("a").is_none());
        assert!(m.dev_dependencies.contains_key("b"));
    }

    #[test]
    fn test_bin_entries() {
        let single = manifest(r#"{"name": "@s/tool", "bin": "cli.js"}"#);
        assert_eq!(single.bin_entries()["tool"], "cli.js");

        let many = manifest(r#"{"name": "x", "bin": {"a": "a.js", "b": 1}}"#);
        let bins = many.bin_entries();
        assert_eq!(bins.len(), 1);
        assert_eq!(bins["a"], "a.js");
    }

    #[test]
    fn test_has_install_scripts() {
        assert!(manifest(r#"{"scripts": {"postinstall": "node x"}}"#).has_install_scripts());
        assert!(!manifest(r#"{"scripts": {"test": "jest"}}"#).has_install_scripts());
    }
}
