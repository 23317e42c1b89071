//! Install entry points.
//!
//! Every entry point takes the run lock on the project (unless
//! `opts.lock` is off) and works on one [`InstallContext`]. Runs that
//! touch the store also lock the store, always after the project.

use super::context::InstallContext;
use super::finalize::{finalize, Finalize};
use super::lifecycle::{
    run_root_scripts, run_scripts, ScriptRunner, ScriptTarget, ShellScriptRunner, ROOT_POST_EVENTS,
    ROOT_PRE_EVENTS,
};
use super::link::{remove_orphan_packages, LinkRequest, Linker, NodeModulesLinker};
use super::options::InstallOptions;
use super::project::ProjectContext;
use super::reconcile::{
    drop_stale_root_entries, merge_resolved, needs_partial_private, next_private, prune,
    root_flags, sync_with_manifest, RootDependency,
};
use super::request::{request_packages, PackageRequest};
use super::run_lock::with_lock;
use super::tree::DependencyTree;
use crate::pkg::link::{
    external_links, is_external_link, link_bins, link_dir, package_path, remove_link_or_dir,
    unlink_bins,
};
use crate::pkg::{
    read_manifest, FsStore, Manifest, NpmRegistry, PackageSpec, PackageStore, PkgError, Registry,
    Resolution, SaveType,
};
use futures::TryStreamExt;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSummary {
    /// Packages resolved this run.
    pub resolved: usize,
    /// Packages materialised for the first time.
    pub added: Vec<String>,
    /// Packages no longer locked.
    pub removed: Vec<String>,
    /// Package ids excluded from installation.
    pub skipped: Vec<String>,
    /// Node ids of the dependency tree's roots.
    pub root_nodes: Vec<String>,
}

/// One engine run over a set of specs.
struct Run {
    specs: Vec<PackageSpec>,
    manifest: Manifest,
    /// Write the resolved root specifiers back to `package.json`, moving
    /// them into this section when set.
    save: Option<Option<SaveType>>,
    /// Named install: only some roots are resolved.
    subset: bool,
}

/// The install engine with its collaborators.
#[derive(Clone)]
pub struct Installer {
    registry: Arc<dyn Registry>,
    store: Arc<dyn PackageStore>,
    runner: Arc<dyn ScriptRunner>,
    linker: Arc<dyn Linker>,
}

impl Installer {
    /// Engine backed by the npm registry, the filesystem store, the
    /// platform shell and the `node_modules` linker.
    ///
    /// # Errors
    /// Returns an error if the registry URL is invalid.
    pub fn new(opts: &InstallOptions) -> Result<Self, PkgError> {
        let store_dir = opts.store();
        let registry = NpmRegistry::new(&opts.registry_url())?
            .with_offline(opts.offline)
            .with_metadata_cache(store_dir.join("metadata"));
        let store = FsStore::new(store_dir, registry.http().clone()).with_offline(opts.offline);

        Ok(Self::with_parts(
            Arc::new(registry),
            Arc::new(store),
            Arc::new(ShellScriptRunner::new(&opts.prefix)),
            Arc::new(NodeModulesLinker),
        ))
    }

    /// Engine with custom collaborators.
    #[must_use]
    pub fn with_parts(
        registry: Arc<dyn Registry>,
        store: Arc<dyn PackageStore>,
        runner: Arc<dyn ScriptRunner>,
        linker: Arc<dyn Linker>,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            linker,
        }
    }

    /// Install every dependency declared in `package.json`.
    ///
    /// # Errors
    /// Returns `PKG_MANIFEST_MISSING` without a manifest, or the first
    /// fatal error of the run.
    pub async fn install(&self, opts: &InstallOptions) -> Result<InstallSummary, PkgError> {
        locked(&opts.prefix, opts, move || self.install_unlocked(opts)).await
    }

    async fn install_unlocked(&self, opts: &InstallOptions) -> Result<InstallSummary, PkgError> {
        let mut project = ProjectContext::load(opts)?;
        let manifest = project.require_manifest()?.clone();

        if !opts.ignore_scripts {
            run_root_scripts(self.runner.as_ref(), &project.root, &manifest, &ROOT_PRE_EVENTS).await?;
        }

        drop_stale_root_entries(&mut project.lockfiles.public, &manifest);
        let specs = manifest.specs(&project.root)?;
        info!(dependencies = specs.len(), "installing");

        let summary = self
            .install_in_context(
                project,
                Run {
                    specs,
                    manifest: manifest.clone(),
                    save: None,
                    subset: false,
                },
                opts,
            )
            .await?;

        if !opts.ignore_scripts {
            run_root_scripts(self.runner.as_ref(), &opts.prefix, &manifest, &ROOT_POST_EVENTS).await?;
        }
        Ok(summary)
    }

    /// Install the named packages and save them to `package.json`.
    ///
    /// `update` defaults to on, so the named packages are re-resolved.
    ///
    /// # Errors
    /// Returns `PKG_ARGS_INVALID` for an empty list, `PKG_MANIFEST_MISSING`
    /// without a manifest, or the first fatal error of the run.
    pub async fn install_pkgs(
        &self,
        args: &[String],
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        if args.is_empty() {
            return Err(PkgError::args_invalid("No packages to install"));
        }
        let mut opts = opts.clone();
        opts.update.get_or_insert(true);
        let opts = &opts;
        locked(&opts.prefix, opts, move || self.install_pkgs_unlocked(args, opts))
            .await
    }

    async fn install_pkgs_unlocked(
        &self,
        args: &[String],
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        let project = ProjectContext::load(opts)?;
        let manifest = project.require_manifest()?.clone();
        let node_modules = crate::paths::node_modules(&project.root);
        let declared = manifest.all_dependencies();
        let flags = root_flags(&manifest);
        let save_type = SaveType::from_flags(opts.save_dev, opts.save_optional);

        let mut specs = Vec::new();
        for arg in args {
            let spec = PackageSpec::parse(arg, &project.root)?;
            if !spec.name.is_empty() && is_external_link(&node_modules, &spec.name, &project.store) {
                warn!(name = %spec.name, "{} is linked from outside the project; skipping", spec.name);
                continue;
            }
            let spec = match declared.get(&spec.name) {
                Some(existing) if spec.raw_spec.is_empty() => {
                    PackageSpec::from_dependency(&spec.name, existing, &project.root)?
                }
                _ => spec.with_default_tag(&opts.tag),
            };
            let (dev, optional) = match save_type {
                Some(SaveType::DevDependencies) => (true, false),
                Some(SaveType::OptionalDependencies) => (false, true),
                _ => flags.get(&spec.name).copied().unwrap_or((false, false)),
            };
            specs.push(spec.with_flags(dev, optional));
        }
        if specs.is_empty() {
            return Ok(InstallSummary::default());
        }
        info!(packages = specs.len(), "installing named packages");

        self.install_in_context(
            project,
            Run {
                specs,
                manifest,
                save: Some(save_type),
                subset: true,
            },
            opts,
        )
        .await
    }

    async fn install_in_context(
        &self,
        project: ProjectContext,
        run: Run,
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        let store = project.store.clone();
        locked(&store, opts, move || self.run_engine(project, run, opts)).await
    }

    async fn run_engine(
        &self,
        project: ProjectContext,
        run: Run,
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        let Run {
            specs,
            mut manifest,
            save,
            subset,
        } = run;
        let root = project.root.clone();
        let mut ctx = InstallContext::new(Arc::clone(&self.store), project.lockfiles, project.skipped);
        let partial = needs_partial_private(subset, &ctx.lockfiles);
        debug!(partial, "private lockfile mode");

        let requests: Vec<PackageRequest> =
            request_packages(&ctx, Arc::clone(&self.registry), specs, opts)
                .try_collect()
                .await?;

        let roots = root_dependencies(&requests);
        let root_edges: Vec<(String, bool, bool)> = roots
            .iter()
            .map(|r| (r.package_id.clone(), r.dev, r.optional))
            .collect();
        ctx.propagate_edge_flags(&root_edges);
        let root_ids: Vec<String> = roots.iter().map(|r| r.package_id.clone()).collect();
        let tree = DependencyTree::build(&root_ids, &ctx);
        ctx.tree = tree;
        debug!(nodes = ctx.tree.len(), "built dependency tree");

        if let Some(save_type) = save {
            for request in requests.iter().filter(|r| r.depth == 0) {
                let Some(installed) = ctx.installed(&request.package_id) else {
                    continue;
                };
                let spec = request.spec.save_spec(&installed.package.version, opts.save_exact);
                manifest.save_dependency(&request.name, &spec, save_type);
            }
        }

        let mut public = ctx.lockfiles.public.clone();
        merge_resolved(&mut public, &ctx, &roots);
        sync_with_manifest(&mut public, &manifest);
        prune(&mut public);

        let touched: BTreeSet<String> = ctx.installs().into_keys().collect();
        let private = next_private(partial, &public, &ctx.lockfiles.private, &touched);
        let removed: Vec<String> = ctx
            .lockfiles
            .private
            .packages
            .keys()
            .filter(|id| !private.packages.contains_key(*id))
            .cloned()
            .collect();

        let outcome = self
            .linker
            .link(LinkRequest {
                ctx: &ctx,
                root: &root,
                roots: &roots,
                shrinkwrap: public,
                private_shrinkwrap: private,
                opts,
            })
            .await?;

        if !opts.ignore_scripts {
            let installs = ctx.installs();
            let targets: Vec<ScriptTarget> = outcome
                .newly_linked_ids
                .iter()
                .filter(|id| !ctx.is_skipped(id))
                .filter(|id| installs.get(*id).is_some_and(|p| p.package.has_scripts))
                .filter_map(|id| {
                    outcome.linked_locations.get(id).map(|dir| ScriptTarget {
                        pkg_id: id.clone(),
                        dir: dir.clone(),
                    })
                })
                .collect();
            debug!(count = targets.len(), "running package scripts");
            run_scripts(&ctx, self.runner.as_ref(), targets, opts.child_concurrency).await?;
        }

        link_local_roots(&ctx, &root, &roots).await?;

        let summary = InstallSummary {
            resolved: ctx.installs().len(),
            added: outcome.newly_linked_ids.clone(),
            removed,
            skipped: ctx.skipped().into_iter().collect(),
            root_nodes: ctx
                .tree
                .roots()
                .iter()
                .map(|&index| ctx.tree.node(index).node_id.clone())
                .collect(),
        };
        finalize(
            &ctx,
            Finalize {
                root: &root,
                manifest: save.is_some().then_some(manifest),
                shrinkwrap: outcome.shrinkwrap,
                private_shrinkwrap: outcome.private_shrinkwrap,
                store: project.store,
                independent_leaves: opts.independent_leaves,
            },
        )
        .await?;

        info!(
            resolved = summary.resolved,
            added = summary.added.len(),
            skipped = summary.skipped.len(),
            "install complete"
        );
        Ok(summary)
    }

    /// Remove the named dependencies from the project.
    ///
    /// # Errors
    /// Returns `PKG_MANIFEST_MISSING` without a manifest, or a write error.
    pub async fn uninstall(
        &self,
        names: &[String],
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        if names.is_empty() {
            return Err(PkgError::args_invalid("No packages to uninstall"));
        }
        let store = opts.store();
        let store = store.as_path();
        locked(&opts.prefix, opts, move || {
            locked(store, opts, move || self.uninstall_unlocked(names, opts))
        })
        .await
    }

    async fn uninstall_unlocked(
        &self,
        names: &[String],
        opts: &InstallOptions,
    ) -> Result<InstallSummary, PkgError> {
        let project = ProjectContext::load(opts)?;
        let mut manifest = project.require_manifest()?.clone();
        let save_type = SaveType::from_flags(opts.save_dev, opts.save_optional);
        for name in names {
            manifest.remove_dependency(name, save_type);
        }

        let pair = &project.lockfiles;
        let partial = needs_partial_private(true, pair);
        let mut public = pair.public.clone();
        sync_with_manifest(&mut public, &manifest);
        prune(&mut public);
        let private = if partial {
            let mut private = pair.private.clone();
            sync_with_manifest(&mut private, &manifest);
            prune(&mut private);
            private
        } else {
            public.clone()
        };

        let node_modules = crate::paths::node_modules(&project.root);
        let declared = manifest.all_dependencies();
        let gone: Vec<String> = names
            .iter()
            .filter(|name| !declared.contains_key(*name))
            .cloned()
            .collect();
        let removed = {
            let old_private = pair.private.clone();
            let new_private = private.clone();
            tokio::task::spawn_blocking(move || {
                let bin_dir = node_modules.join(".bin");
                for name in &gone {
                    let path = package_path(&node_modules, name);
                    unlink_bins(&path, &bin_dir)?;
                    remove_link_or_dir(&path)?;
                }
                remove_orphan_packages(&node_modules, &old_private, &new_private)
            })
            .await
            .map_err(|e| PkgError::link_failed(format!("Uninstall task failed: {e}")))??
        };

        let skipped: BTreeSet<String> = project
            .skipped
            .iter()
            .filter(|id| private.packages.contains_key(*id))
            .cloned()
            .collect();
        let ctx = InstallContext::new(Arc::clone(&self.store), project.lockfiles.clone(), skipped);
        finalize(
            &ctx,
            Finalize {
                root: &project.root,
                manifest: Some(manifest),
                shrinkwrap: public,
                private_shrinkwrap: private,
                store: project.store.clone(),
                independent_leaves: opts.independent_leaves,
            },
        )
        .await?;

        info!(removed = removed.len(), "uninstall complete");
        Ok(InstallSummary {
            resolved: 0,
            added: Vec::new(),
            removed,
            skipped: ctx.skipped().into_iter().collect(),
            root_nodes: Vec::new(),
        })
    }

    /// Link the package in `dir` into the project's `node_modules`.
    /// Returns the linked package name.
    ///
    /// # Errors
    /// Returns an error if `dir` has no named manifest or the link fails.
    pub async fn link(&self, dir: &Path, opts: &InstallOptions) -> Result<String, PkgError> {
        locked(&opts.prefix, opts, move || link_package(dir, opts)).await
    }

    /// Remove every external link from `node_modules`, reinstalling the
    /// names the manifest still declares.
    ///
    /// # Errors
    /// Returns an error if a link cannot be removed or the reinstall fails.
    pub async fn unlink(&self, opts: &InstallOptions) -> Result<Vec<String>, PkgError> {
        locked(&opts.prefix, opts, move || async move {
            let node_modules = crate::paths::node_modules(&opts.prefix);
            let names = external_links(&node_modules, &opts.store());
            if names.is_empty() {
                info!("nothing to unlink");
                return Ok(Vec::new());
            }
            self.unlink_unlocked(&names, opts).await
        })
        .await
    }

    /// Remove the named external links, reinstalling the names the
    /// manifest still declares.
    ///
    /// # Errors
    /// Returns an error if a link cannot be removed or the reinstall fails.
    pub async fn unlink_pkgs(
        &self,
        names: &[String],
        opts: &InstallOptions,
    ) -> Result<Vec<String>, PkgError> {
        locked(&opts.prefix, opts, move || self.unlink_unlocked(names, opts)).await
    }

    async fn unlink_unlocked(
        &self,
        names: &[String],
        opts: &InstallOptions,
    ) -> Result<Vec<String>, PkgError> {
        let node_modules = crate::paths::node_modules(&opts.prefix);
        let store = opts.store();
        let bin_dir = node_modules.join(".bin");

        let mut unlinked = Vec::new();
        for name in names {
            if !is_external_link(&node_modules, name, &store) {
                warn!(name = %name, "{name} is not an external link");
                continue;
            }
            let path = package_path(&node_modules, name);
            unlink_bins(&path, &bin_dir)?;
            remove_link_or_dir(&path)?;
            info!(name = %name, "unlinked");
            unlinked.push(name.clone());
        }

        let declared = read_manifest(&opts.prefix)?
            .map(|m| m.all_dependencies())
            .unwrap_or_default();
        let reinstall: Vec<String> = unlinked
            .iter()
            .filter(|name| declared.contains_key(*name))
            .cloned()
            .collect();
        if !reinstall.is_empty() {
            let mut opts = opts.clone();
            opts.update.get_or_insert(true);
            self.install_pkgs_unlocked(&reinstall, &opts).await?;
        }
        Ok(unlinked)
    }
}

/// Run `op` holding the run lock on `dir`, or unlocked when `opts.lock`
/// is off.
async fn locked<T, F, Fut>(dir: &Path, opts: &InstallOptions, op: F) -> Result<T, PkgError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PkgError>>,
{
    if opts.lock {
        with_lock(dir, opts.lock_stale_duration, &opts.retry, op).await
    } else {
        op().await
    }
}

/// Direct dependencies from the depth-0 requests, one per name.
fn root_dependencies(requests: &[PackageRequest]) -> Vec<RootDependency> {
    let mut seen = HashSet::new();
    requests
        .iter()
        .filter(|r| r.depth == 0 && r.parent_id.is_none())
        .filter(|r| seen.insert(r.name.clone()))
        .map(|r| RootDependency {
            name: r.name.clone(),
            package_id: r.package_id.clone(),
            dev: r.spec.dev,
            optional: r.spec.optional,
        })
        .collect()
}

/// Symlink root dependencies on local directories into `node_modules`.
async fn link_local_roots(
    ctx: &InstallContext,
    root: &Path,
    roots: &[RootDependency],
) -> Result<(), PkgError> {
    let local_ids: HashSet<String> = ctx
        .local_packages()
        .into_iter()
        .map(|local| local.package.id)
        .collect();
    let links: Vec<(String, PathBuf)> = roots
        .iter()
        .filter(|r| local_ids.contains(&r.package_id) && !ctx.is_skipped(&r.package_id))
        .filter_map(|r| match ctx.installed(&r.package_id)?.package.resolution {
            Resolution::Directory { directory } => Some((r.name.clone(), directory)),
            _ => None,
        })
        .collect();
    if links.is_empty() {
        return Ok(());
    }

    let node_modules = crate::paths::node_modules(root);
    tokio::task::spawn_blocking(move || {
        let bin_dir = node_modules.join(".bin");
        for (name, directory) in &links {
            debug!(name = %name, dir = %directory.display(), "linking local package");
            link_dir(directory, &package_path(&node_modules, name))?;
            link_bins(directory, &bin_dir)?;
        }
        Ok::<(), PkgError>(())
    })
    .await
    .map_err(|e| PkgError::link_failed(format!("Link task failed: {e}")))?
}

async fn link_package(dir: &Path, opts: &InstallOptions) -> Result<String, PkgError> {
    let spec = PackageSpec::parse(&format!("link:{}", dir.display()), &opts.prefix)?;
    let target = dunce::canonicalize(&spec.fetch_spec)
        .map_err(|_| PkgError::not_found(&spec.fetch_spec))?;
    let manifest = read_manifest(&target)?.ok_or_else(|| PkgError::manifest_missing(&target))?;
    let name = manifest
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PkgError::package_json_invalid(format!("{} has no name", target.display())))?;

    let node_modules = crate::paths::node_modules(&opts.prefix);
    let link_name = name.clone();
    tokio::task::spawn_blocking(move || {
        link_dir(&target, &package_path(&node_modules, &link_name))?;
        link_bins(&target, &node_modules.join(".bin"))?;
        info!(name = %link_name, target = %target.display(), "linked");
        Ok::<(), PkgError>(())
    })
    .await
    .map_err(|e| PkgError::link_failed(format!("Link task failed: {e}")))??;
    Ok(name)
}
