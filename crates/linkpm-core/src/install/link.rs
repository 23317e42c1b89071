//! Materialising `node_modules`.
//!
//! Layout:
//! ```text
//! node_modules/<name>                                  -> .linkpm/<dir>/node_modules/<name>
//! node_modules/.bin/<cmd>                              executables of root packages
//! node_modules/.linkpm/<dir>/node_modules/<name>/      package files, hard-linked from the store
//! node_modules/.linkpm/<dir>/node_modules/<dep>        -> ../../<dep dir>/node_modules/<dep>
//! ```
//! where `<dir>` is `name@version` with `/` replaced by `+`.

use super::context::InstallContext;
use super::options::InstallOptions;
use super::reconcile::RootDependency;
use crate::pkg::link::{hardlink_dir, link_bins, link_dir, package_path, read_link, remove_link_or_dir};
use crate::pkg::package::parse_package_id;
use crate::pkg::{Lockfile, PkgError};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Virtual store directory inside `node_modules`.
pub const VIRTUAL_STORE_DIR: &str = ".linkpm";

/// Everything a linker needs for one run.
pub struct LinkRequest<'a> {
    pub ctx: &'a InstallContext,
    pub root: &'a Path,
    pub roots: &'a [RootDependency],
    /// Public lockfile after reconciliation.
    pub shrinkwrap: Lockfile,
    /// Private lockfile to write after linking.
    pub private_shrinkwrap: Lockfile,
    pub opts: &'a InstallOptions,
}

/// What a linker did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub shrinkwrap: Lockfile,
    pub private_shrinkwrap: Lockfile,
    /// Packages whose directory did not exist before this run.
    pub newly_linked_ids: Vec<String>,
    /// Package directory by id.
    pub linked_locations: BTreeMap<String, PathBuf>,
}

/// Builds a `node_modules` layout from a resolved run.
pub trait Linker: Send + Sync {
    fn link<'a>(&'a self, request: LinkRequest<'a>) -> BoxFuture<'a, Result<LinkOutcome, PkgError>>;
}

/// Virtual store directory name of a package id.
#[must_use]
pub fn package_dir_name(id: &str) -> String {
    match parse_package_id(id) {
        Some((name, version)) => format!("{}@{version}", name.replace('/', "+")),
        None => id.trim_start_matches('/').replace(['/', ':', '\\'], "+"),
    }
}

/// The `node_modules` directory a package and its dependencies share.
#[must_use]
pub fn virtual_node_modules(node_modules: &Path, id: &str) -> PathBuf {
    node_modules
        .join(VIRTUAL_STORE_DIR)
        .join(package_dir_name(id))
        .join("node_modules")
}

/// Where package `name` with id `id` lives in the virtual store.
#[must_use]
pub fn virtual_store_path(node_modules: &Path, id: &str, name: &str) -> PathBuf {
    package_path(&virtual_node_modules(node_modules, id), name)
}

/// Remove virtual store entries that `old` locks and `new` does not, and
/// top-level links to them. Returns the removed ids.
///
/// # Errors
/// Returns an error if a directory cannot be removed.
pub fn remove_orphan_packages(
    node_modules: &Path,
    old: &Lockfile,
    new: &Lockfile,
) -> Result<Vec<String>, PkgError> {
    let virtual_store = node_modules.join(VIRTUAL_STORE_DIR);
    let mut removed = Vec::new();

    for id in old.packages.keys() {
        if new.packages.contains_key(id) || id.starts_with("link:") {
            continue;
        }
        let dir = virtual_store.join(package_dir_name(id));
        if dir.symlink_metadata().is_ok() {
            debug!(pkg_id = %id, "removing orphan");
            remove_link_or_dir(&dir)?;
        }
        removed.push(id.clone());
    }

    let still_declared = new.root_references();
    for name in old.root_references().keys() {
        if still_declared.contains_key(name) {
            continue;
        }
        let path = package_path(node_modules, name);
        if read_link(&path).is_some_and(|t| linkpm_util::fs::is_subdir(&virtual_store, &t)) {
            remove_link_or_dir(&path)?;
        }
    }
    Ok(removed)
}

/// Default linker: hard-linked virtual store plus symlinks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeModulesLinker;

impl Linker for NodeModulesLinker {
    fn link<'a>(&'a self, request: LinkRequest<'a>) -> BoxFuture<'a, Result<LinkOutcome, PkgError>> {
        link_node_modules(request).boxed()
    }
}

fn wanted(ctx: &InstallContext, opts: &InstallOptions, id: &str) -> bool {
    if ctx.is_skipped(id) {
        return false;
    }
    if opts.production && !ctx.is_non_dev(id) {
        return false;
    }
    opts.optional || ctx.is_non_optional(id)
}

async fn link_node_modules(request: LinkRequest<'_>) -> Result<LinkOutcome, PkgError> {
    let LinkRequest {
        ctx,
        root,
        roots,
        shrinkwrap,
        private_shrinkwrap,
        opts,
    } = request;
    let node_modules = crate::paths::node_modules(root);

    let old_private = ctx.lockfiles.private.clone();
    let orphans = {
        let node_modules = node_modules.clone();
        let new_private = private_shrinkwrap.clone();
        tokio::task::spawn_blocking(move || {
            remove_orphan_packages(&node_modules, &old_private, &new_private)
        })
        .await
        .map_err(|e| PkgError::link_failed(format!("Link task failed: {e}")))??
    };
    if !orphans.is_empty() {
        debug!(count = orphans.len(), "removed orphan packages");
    }

    let installs = ctx.installs();
    let to_link: Vec<String> = ctx
        .tree
        .installable_package_ids()
        .into_iter()
        .filter(|id| installs.get(id).is_some_and(|p| !p.package.is_local()))
        .filter(|id| wanted(ctx, opts, id))
        .collect();

    let results: Vec<Result<Option<(String, PathBuf, bool)>, PkgError>> = stream::iter(to_link)
        .map(|id| {
            let node_modules = node_modules.clone();
            let installed = installs.get(&id).cloned();
            async move {
                let Some(installed) = installed else {
                    return Ok(None);
                };
                let pkg = installed.package;
                let content = match ctx.fetch(&pkg).files.await {
                    Ok(content) => content,
                    Err(e) if !ctx.is_non_optional(&id) => {
                        warn!(pkg_id = %id, error = %e, "Skipping failed optional dependency {id}");
                        ctx.skip(&id);
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };

                let dest = virtual_store_path(&node_modules, &id, &pkg.name);
                let leaf = opts.independent_leaves && pkg.dependencies.is_empty();
                let target = dest.clone();
                let newly = tokio::task::spawn_blocking(move || {
                    let newly = !target.join("package.json").exists();
                    if leaf {
                        link_dir(&content.dir, &target)?;
                    } else {
                        if read_link(&target).is_some() {
                            remove_link_or_dir(&target)?;
                        }
                        hardlink_dir(&content.dir, &target)?;
                    }
                    Ok::<bool, PkgError>(newly)
                })
                .await
                .map_err(|e| PkgError::link_failed(format!("Link task failed: {e}")))??;

                Ok(Some((id, dest, newly)))
            }
        })
        .buffer_unordered(opts.network_concurrency.max(1))
        .collect()
        .await;

    let mut linked_locations = BTreeMap::new();
    let mut newly_linked_ids = BTreeSet::new();
    for result in results {
        if let Some((id, dest, newly)) = result? {
            if newly {
                newly_linked_ids.insert(id.clone());
            }
            linked_locations.insert(id, dest);
        }
    }

    let node_modules_for_links = node_modules.clone();
    let locations = &linked_locations;
    let dependency_links: Vec<(PathBuf, PathBuf)> = locations
        .keys()
        .filter_map(|id| installs.get(id).map(|p| (id, p)))
        .flat_map(|(id, installed)| {
            let own_name = installed.package.name.clone();
            let parent_modules = virtual_node_modules(&node_modules, id);
            installed
                .child_names
                .iter()
                .filter(move |(name, _)| **name != own_name)
                .filter_map(|(name, child_id)| {
                    let target = match locations.get(child_id) {
                        Some(location) => location.clone(),
                        None => match installs.get(child_id).map(|c| &c.package.resolution) {
                            Some(crate::pkg::Resolution::Directory { directory }) => directory.clone(),
                            _ => return None,
                        },
                    };
                    Some((target, package_path(&parent_modules, name)))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let root_links: Vec<(String, PathBuf)> = roots
        .iter()
        .filter(|r| !(opts.production && r.dev) && (opts.optional || !r.optional))
        .filter_map(|r| {
            linked_locations
                .get(&r.package_id)
                .map(|location| (r.name.clone(), location.clone()))
        })
        .collect();

    tokio::task::spawn_blocking(move || {
        for (target, link) in &dependency_links {
            link_dir(target, link)?;
        }
        let bin_dir = node_modules_for_links.join(".bin");
        for (name, location) in &root_links {
            link_dir(location, &package_path(&node_modules_for_links, name))?;
            link_bins(location, &bin_dir)?;
        }
        Ok::<(), PkgError>(())
    })
    .await
    .map_err(|e| PkgError::link_failed(format!("Link task failed: {e}")))??;

    Ok(LinkOutcome {
        shrinkwrap,
        private_shrinkwrap,
        newly_linked_ids: newly_linked_ids.into_iter().collect(),
        linked_locations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::LockPackage;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_package_dir_name() {
        assert_eq!(package_dir_name("/foo/1.0.0"), "foo@1.0.0");
        assert_eq!(package_dir_name("/@s/foo/1.0.0"), "@s+foo@1.0.0");
    }

    #[test]
    fn test_virtual_store_path() {
        let nm = Path::new("/p/node_modules");
        assert_eq!(
            virtual_store_path(nm, "/@s/foo/1.0.0", "@s/foo"),
            Path::new("/p/node_modules/.linkpm/@s+foo@1.0.0/node_modules/@s/foo")
        );
    }

    #[test]
    fn test_remove_orphan_packages() {
        let tmp = tempdir().unwrap();
        let nm = tmp.path().join("node_modules");
        let kept = virtual_store_path(&nm, "/a/1.0.0", "a");
        let orphan = virtual_store_path(&nm, "/b/1.0.0", "b");
        fs::create_dir_all(&kept).unwrap();
        fs::create_dir_all(&orphan).unwrap();
        link_dir(&orphan, &nm.join("b")).unwrap();

        let entry = |name: &str| LockPackage {
            name: name.into(),
            version: "1.0.0".into(),
            resolution: crate::pkg::LockResolution::Registry {
                tarball: String::new(),
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
        };
        let mut old = Lockfile::default();
        old.packages.insert("/a/1.0.0".into(), entry("a"));
        old.packages.insert("/b/1.0.0".into(), entry("b"));
        old.dependencies.insert("b".into(), "1.0.0".into());
        let mut new = Lockfile::default();
        new.packages.insert("/a/1.0.0".into(), entry("a"));

        let removed = remove_orphan_packages(&nm, &old, &new).unwrap();

        assert_eq!(removed, ["/b/1.0.0"]);
        assert!(kept.exists());
        assert!(!nm.join(VIRTUAL_STORE_DIR).join("b@1.0.0").exists());
        assert!(nm.join("b").symlink_metadata().is_err());
    }
}
