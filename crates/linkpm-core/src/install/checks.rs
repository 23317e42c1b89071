//! Platform and engine compatibility checks.

use crate::pkg::version::version_satisfies;
use crate::pkg::{PkgError, ResolvedPackage};
use crate::version::VERSION;
use tracing::warn;

/// Why a package does not fit the current environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    Platform(String),
    Engine(String),
}

impl Incompatibility {
    fn into_error(self) -> PkgError {
        match self {
            Self::Platform(msg) => PkgError::platform_mismatch(msg),
            Self::Engine(msg) => PkgError::engine_mismatch(msg),
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Platform(msg) | Self::Engine(msg) => msg,
        }
    }
}

/// `process.platform` of the running OS.
#[must_use]
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// `process.arch` of the running CPU.
#[must_use]
pub fn current_cpu() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// npm allow/deny list: `["darwin", "linux"]` or `["!win32"]`.
fn list_allows(list: &[String], current: &str) -> bool {
    if list.is_empty() || list.iter().any(|e| e == "any") {
        return true;
    }
    let mut has_positive = false;
    let mut matched = false;
    for entry in list {
        if let Some(denied) = entry.strip_prefix('!') {
            if denied == current {
                return false;
            }
        } else {
            has_positive = true;
            matched |= entry == current;
        }
    }
    !has_positive || matched
}

/// Check `os` and `cpu` against the given platform.
#[must_use]
pub fn check_platform(pkg: &ResolvedPackage, os: &str, cpu: &str) -> Option<Incompatibility> {
    if list_allows(&pkg.os, os) && list_allows(&pkg.cpu, cpu) {
        return None;
    }
    Some(Incompatibility::Platform(format!(
        "{} is not supported on {os}/{cpu} (wanted os: {:?}, cpu: {:?})",
        pkg.id, pkg.os, pkg.cpu
    )))
}

/// Check `engines.node` and `engines.linkpm`.
///
/// Without a known Node.js version only the linkpm engine is checked.
#[must_use]
pub fn check_engine(pkg: &ResolvedPackage, node_version: Option<&str>) -> Option<Incompatibility> {
    let checks = [("node", node_version), ("linkpm", Some(VERSION))];
    for (engine, current) in checks {
        let (Some(wanted), Some(current)) = (pkg.engines.get(engine), current) else {
            continue;
        };
        let current = current.trim_start_matches('v');
        if !version_satisfies(current, wanted) {
            return Some(Incompatibility::Engine(format!(
                "{} requires {engine} {wanted}, found {current}",
                pkg.id
            )));
        }
    }
    None
}

/// Decide whether a package gets installed.
///
/// Incompatible optional packages are skipped; incompatible required
/// packages fail under `engine_strict` and are installed with a warning
/// otherwise.
///
/// # Errors
/// Returns `PKG_PLATFORM_MISMATCH` / `PKG_ENGINE_MISMATCH` under `engine_strict`.
pub fn is_installable(
    pkg: &ResolvedPackage,
    optional: bool,
    engine_strict: bool,
    node_version: Option<&str>,
) -> Result<bool, PkgError> {
    let Some(problem) = check_platform(pkg, current_os(), current_cpu())
        .or_else(|| check_engine(pkg, node_version))
    else {
        return Ok(true);
    };

    if optional {
        warn!(pkg_id = %pkg.id, reason = problem.message(), "Skipping failed optional dependency {}", pkg.id);
        return Ok(false);
    }
    if engine_strict {
        return Err(problem.into_error());
    }
    warn!(pkg_id = %pkg.id, "{}", problem.message());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use crate::pkg::Resolution;
    use std::collections::BTreeMap;

    fn pkg() -> ResolvedPackage {
        ResolvedPackage {
            id: "/foo/1.0.0".into(),
            name: "foo".into(),
            version: "1.0.0".into(),
            resolution: Resolution::Registry {
                tarball: String::new(),
                integrity: None,
            },
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            engines: BTreeMap::new(),
            os: Vec::new(),
            cpu: Vec::new(),
            has_scripts: false,
        }
    }

    fn other_os() -> String {
        if current_os() == "aix" { "sunos" } else { "aix" }.to_string()
    }

    #[test]
    fn test_platform_lists() {
        let mut p = pkg();
        assert!(check_platform(&p, "linux", "x64").is_none());

        p.os = vec!["darwin".into(), "linux".into()];
        assert!(check_platform(&p, "linux", "x64").is_none());
        assert!(check_platform(&p, "win32", "x64").is_some());

        p.os = vec!["!win32".into()];
        assert!(check_platform(&p, "linux", "x64").is_none());
        assert!(check_platform(&p, "win32", "x64").is_some());

        p.os = Vec::new();
        p.cpu = vec!["arm64".into()];
        assert!(check_platform(&p, "linux", "x64").is_some());
    }

    #[test]
    fn test_engine_node() {
        let mut p = pkg();
        p.engines.insert("node".into(), ">=18".into());
        assert!(check_engine(&p, Some("v20.1.0")).is_none());
        assert!(check_engine(&p, Some("16.0.0")).is_some());
        assert!(check_engine(&p, None).is_none());
    }

    #[test]
    fn test_optional_incompatible_is_skipped() {
        let mut p = pkg();
        p.os = vec![other_os()];
        assert!(!is_installable(&p, true, true, None).unwrap());
    }

    #[test]
    fn test_required_incompatible() {
        let mut p = pkg();
        p.os = vec![other_os()];
        assert!(is_installable(&p, false, false, None).unwrap());

        let err = is_installable(&p, false, true, None).unwrap_err();
        assert_eq!(err.code(), codes::PKG_PLATFORM_MISMATCH);
    }

    #[test]
    fn test_engine_strict_error_code() {
        let mut p = pkg();
        p.engines.insert("node".into(), "^99.0.0".into());
        let err = is_installable(&p, false, true, Some("20.0.0")).unwrap_err();
        assert_eq!(err.code(), codes::PKG_ENGINE_MISMATCH);
    }
}
