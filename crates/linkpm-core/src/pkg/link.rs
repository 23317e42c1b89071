//! Filesystem primitives for building `node_modules`.
//!
//! Directory links are symlinks on Unix and junctions on Windows.

use super::error::PkgError;
use super::manifest::read_manifest;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Location of package `name` inside a `node_modules` directory.
///
/// Scoped names map to `node_modules/@scope/name`.
#[must_use]
pub fn package_path(node_modules: &Path, name: &str) -> PathBuf {
    name.split('/')
        .fold(node_modules.to_path_buf(), |path, part| path.join(part))
}

/// Make `link_path` a directory link to `target`, replacing whatever was there.
///
/// # Errors
/// Returns an error if the old entry cannot be removed or the link created.
pub fn link_dir(target: &Path, link_path: &Path) -> Result<(), PkgError> {
    if let Some(parent) = link_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PkgError::node_modules_write_failed(format!(
                "Failed to create {}: {e}",
                parent.display()
            ))
        })?;
    }

    if read_link(link_path).as_deref() == Some(target) {
        return Ok(());
    }
    if link_path.symlink_metadata().is_ok() {
        remove_link_or_dir(link_path)?;
    }

    create_dir_link(target, link_path)
}

/// The target of a symlink or junction, if `path` is one.
#[must_use]
pub fn read_link(path: &Path) -> Option<PathBuf> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !is_link(&meta) {
        return None;
    }
    let target = fs::read_link(path).ok()?;
    Some(if target.is_absolute() {
        target
    } else {
        path.parent().map_or(target.clone(), |p| p.join(&target))
    })
}

#[cfg(unix)]
fn is_link(meta: &fs::Metadata) -> bool {
    meta.file_type().is_symlink()
}

#[cfg(windows)]
fn is_link(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    // FILE_ATTRIBUTE_REPARSE_POINT
    meta.file_attributes() & 0x400 != 0
}

#[cfg(not(any(unix, windows)))]
fn is_link(meta: &fs::Metadata) -> bool {
    meta.file_type().is_symlink()
}

/// Whether `node_modules/<name>` links somewhere outside both
/// `node_modules` and the store, i.e. was created by `link`.
#[must_use]
pub fn is_external_link(node_modules: &Path, name: &str, store: &Path) -> bool {
    let Some(target) = read_link(&package_path(node_modules, name)) else {
        return false;
    };
    !linkpm_util::fs::is_subdir(node_modules, &target) && !linkpm_util::fs::is_subdir(store, &target)
}

/// Remove a symlink, junction, file, or directory tree. Missing paths are fine.
///
/// # Errors
/// Returns an error if removal fails.
pub fn remove_link_or_dir(path: &Path) -> Result<(), PkgError> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };

    let result = if is_link(&meta) {
        // Junctions are directories to Windows; symlinks are files to Unix
        if cfg!(windows) {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    } else if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|e| PkgError::link_failed(format!("Failed to remove {}: {e}", path.display())))
}

fn create_dir_link(target: &Path, link_path: &Path) -> Result<(), PkgError> {
    platform_dir_link(target, link_path).map_err(|e| {
        PkgError::link_failed(format!(
            "Failed to link {} -> {}: {e}",
            link_path.display(),
            target.display()
        ))
    })
}

#[cfg(unix)]
fn platform_dir_link(target: &Path, link_path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

#[cfg(windows)]
fn platform_dir_link(target: &Path, link_path: &Path) -> io::Result<()> {
    junction::create(target, link_path)
}

#[cfg(not(any(unix, windows)))]
fn platform_dir_link(target: &Path, link_path: &Path) -> io::Result<()> {
    super::tarball::copy_dir_all(target, link_path)
}

/// Mirror `src` into `dst` with hard links, copying where linking fails
/// (e.g. across filesystems). Existing files in `dst` are kept.
///
/// # Errors
/// Returns an error if a directory cannot be created or a file copied.
pub fn hardlink_dir(src: &Path, dst: &Path) -> Result<(), PkgError> {
    let failed = |e: io::Error| {
        PkgError::link_failed(format!(
            "Failed to import {} into {}: {e}",
            src.display(),
            dst.display()
        ))
    };

    fs::create_dir_all(dst).map_err(failed)?;
    for entry in fs::read_dir(src).map_err(failed)? {
        let entry = entry.map_err(failed)?;
        let ty = entry.file_type().map_err(failed)?;
        let to = dst.join(entry.file_name());

        if ty.is_dir() {
            hardlink_dir(&entry.path(), &to)?;
        } else if ty.is_file()
            && to.symlink_metadata().is_err()
            && fs::hard_link(entry.path(), &to).is_err()
        {
            fs::copy(entry.path(), &to).map_err(failed)?;
        }
    }
    Ok(())
}

/// Link the executables declared by the package in `pkg_dir` into
/// `bin_dir`. Returns the command names linked.
///
/// # Errors
/// Returns an error if the manifest is invalid or a link cannot be created.
pub fn link_bins(pkg_dir: &Path, bin_dir: &Path) -> Result<Vec<String>, PkgError> {
    let Some(manifest) = read_manifest(pkg_dir)? else {
        return Ok(Vec::new());
    };
    let bins: Vec<(String, String)> = manifest
        .bin_entries()
        .into_iter()
        .filter(|(cmd, _)| !cmd.is_empty() && !cmd.starts_with('.') && !cmd.contains(['/', '\\']))
        .collect();
    if bins.is_empty() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(bin_dir).map_err(|e| {
        PkgError::node_modules_write_failed(format!("Failed to create {}: {e}", bin_dir.display()))
    })?;
    for (cmd, rel) in &bins {
        let target = pkg_dir.join(rel);
        let link = bin_dir.join(cmd);
        platform_bin_link(&target, &link).map_err(|e| {
            PkgError::link_failed(format!(
                "Failed to link bin {} -> {}: {e}",
                link.display(),
                target.display()
            ))
        })?;
    }
    Ok(bins.into_iter().map(|(cmd, _)| cmd).collect())
}

/// Remove the executables the package in `pkg_dir` linked into `bin_dir`.
///
/// # Errors
/// Returns an error if the manifest is invalid or a link cannot be removed.
pub fn unlink_bins(pkg_dir: &Path, bin_dir: &Path) -> Result<(), PkgError> {
    let Some(manifest) = read_manifest(pkg_dir)? else {
        return Ok(());
    };
    for cmd in manifest.bin_entries().keys() {
        if cmd.is_empty() || cmd.starts_with('.') || cmd.contains(['/', '\\']) {
            continue;
        }
        remove_link_or_dir(&bin_dir.join(cmd))?;
        if cfg!(not(unix)) {
            remove_link_or_dir(&bin_dir.join(cmd).with_extension("cmd"))?;
        }
    }
    Ok(())
}

/// Names in `node_modules` that are external links, scoped names included.
#[must_use]
pub fn external_links(node_modules: &Path, store: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(node_modules) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if name.starts_with('@') && read_link(&entry.path()).is_none() {
            let Ok(scoped) = fs::read_dir(entry.path()) else {
                continue;
            };
            names.extend(
                scoped
                    .flatten()
                    .map(|e| format!("{name}/{}", e.file_name().to_string_lossy())),
            );
        } else {
            names.push(name);
        }
    }
    names.retain(|name| is_external_link(node_modules, name, store));
    names.sort();
    names
}

#[cfg(unix)]
fn platform_bin_link(target: &Path, link: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    if let Ok(meta) = fs::metadata(target) {
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(target, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn platform_bin_link(target: &Path, link: &Path) -> io::Result<()> {
    fs::write(
        link.with_extension("cmd"),
        format!("@node \"{}\" %*\r\n", target.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_package(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), "{}").unwrap();
    }

    #[test]
    fn test_package_path_scoped() {
        let nm = Path::new("/p/node_modules");
        assert_eq!(package_path(nm, "react"), nm.join("react"));
        assert_eq!(package_path(nm, "@types/node"), nm.join("@types").join("node"));
    }

    #[test]
    fn test_link_dir_replaces_existing_directory() {
        let root = tempdir().unwrap();
        let target = root.path().join("store").join("foo");
        fake_package(&target);

        let link = package_path(&root.path().join("node_modules"), "@s/foo");
        fs::create_dir_all(&link).unwrap();
        fs::write(link.join("old.txt"), "old").unwrap();

        link_dir(&target, &link).unwrap();
        link_dir(&target, &link).unwrap();

        assert!(link.join("package.json").exists());
        assert!(!link.join("old.txt").exists());
        assert_eq!(read_link(&link), Some(target));
    }

    #[test]
    fn test_external_link_detection() {
        let root = tempdir().unwrap();
        let nm = root.path().join("project").join("node_modules");
        let store = root.path().join("store");
        let outside = root.path().join("elsewhere");
        let in_store = store.join("bar").join("1.0.0").join("package");
        fake_package(&outside);
        fake_package(&in_store);

        link_dir(&outside, &package_path(&nm, "foo")).unwrap();
        link_dir(&in_store, &package_path(&nm, "bar")).unwrap();
        fake_package(&package_path(&nm, "plain"));

        assert!(is_external_link(&nm, "foo", &store));
        assert!(!is_external_link(&nm, "bar", &store));
        assert!(!is_external_link(&nm, "plain", &store));
        assert!(!is_external_link(&nm, "missing", &store));
    }

    #[test]
    fn test_remove_link_keeps_target() {
        let root = tempdir().unwrap();
        let target = root.path().join("target");
        fake_package(&target);
        let link = root.path().join("link");
        link_dir(&target, &link).unwrap();

        remove_link_or_dir(&link).unwrap();
        remove_link_or_dir(&link).unwrap();

        assert!(link.symlink_metadata().is_err());
        assert!(target.join("package.json").exists());
    }

    #[test]
    fn test_hardlink_dir() {
        let root = tempdir().unwrap();
        let src = root.path().join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("package.json"), "{}").unwrap();
        fs::write(src.join("lib").join("index.js"), "1").unwrap();

        let dst = root.path().join("dst");
        hardlink_dir(&src, &dst).unwrap();
        hardlink_dir(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("lib").join("index.js")).unwrap(), "1");
    }

    #[test]
    fn test_external_links_include_scoped() {
        let root = tempdir().unwrap();
        let nm = root.path().join("node_modules");
        let store = root.path().join("store");
        let outside = root.path().join("elsewhere");
        fake_package(&outside);

        link_dir(&outside, &package_path(&nm, "foo")).unwrap();
        link_dir(&outside, &package_path(&nm, "@s/bar")).unwrap();
        fake_package(&package_path(&nm, "plain"));
        fs::create_dir_all(nm.join(".bin")).unwrap();

        assert_eq!(external_links(&nm, &store), ["@s/bar", "foo"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_bins() {
        let root = tempdir().unwrap();
        let pkg = root.path().join("tool");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{"name":"tool","bin":{"tool":"cli.js","../evil":"x.js"}}"#,
        )
        .unwrap();
        fs::write(pkg.join("cli.js"), "#!/usr/bin/env node\n").unwrap();

        let bin_dir = root.path().join(".bin");
        assert_eq!(link_bins(&pkg, &bin_dir).unwrap(), ["tool"]);
        assert_eq!(fs::read_link(bin_dir.join("tool")).unwrap(), pkg.join("cli.js"));
        assert!(!root.path().join("evil").exists());
    }
}
