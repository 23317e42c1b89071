//! Package request dispatcher.
//!
//! Resolves root specs and, level by level, the dependencies of every
//! package reached. Locked versions are reused below the update depth.

use super::checks::is_installable;
use super::context::{InstallContext, LocalPackage};
use super::options::InstallOptions;
use crate::pkg::lockfile::dependency_id;
use crate::pkg::{
    max_satisfying, version_satisfies, LockPackage, PackageSpec, PkgError, Registry,
    ResolvedPackage, SpecType,
};
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// One resolved request for a package at a given depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub spec: PackageSpec,
    /// Name the dependent refers to the package by.
    pub name: String,
    pub depth: usize,
    pub package_id: String,
    pub installable: bool,
    /// Dependent package, `None` for root requests.
    pub parent_id: Option<String>,
}

enum Expansion {
    Roots(Vec<PackageSpec>),
    Children {
        parent: ResolvedPackage,
        dev: bool,
        optional: bool,
    },
}

type ExpandFuture<'a> = BoxFuture<'a, Result<Vec<PackageRequest>, PkgError>>;

struct Dispatch<'a> {
    ctx: &'a InstallContext,
    registry: Arc<dyn Registry>,
    opts: &'a InstallOptions,
    pending: FuturesUnordered<ExpandFuture<'a>>,
    ready: VecDeque<PackageRequest>,
    emitted: HashSet<(String, usize)>,
    expanded: HashSet<String>,
    failed: bool,
}

impl<'a> Dispatch<'a> {
    fn spawn(&mut self, expansion: Expansion, depth: usize) {
        let fut = expand(
            self.ctx,
            Arc::clone(&self.registry),
            self.opts,
            expansion,
            depth,
        );
        self.pending.push(fut.boxed());
    }

    fn accept(&mut self, requests: Vec<PackageRequest>) {
        for request in requests {
            if request.installable && self.expanded.insert(request.package_id.clone()) {
                if let Some(installed) = self.ctx.installed(&request.package_id) {
                    if !installed.package.is_local() {
                        self.spawn(
                            Expansion::Children {
                                parent: installed.package,
                                dev: request.spec.dev,
                                optional: request.spec.optional,
                            },
                            request.depth + 1,
                        );
                    }
                }
            }
            if self
                .emitted
                .insert((request.spec.raw.clone(), request.depth))
            {
                self.ready.push_back(request);
            }
        }
    }
}

/// Resolve `specs` and everything they depend on.
///
/// Emits one event per unique `(spec, depth)`. The stream ends after the
/// first error. Fetches are registered in the context, not started.
pub fn request_packages<'a>(
    ctx: &'a InstallContext,
    registry: Arc<dyn Registry>,
    specs: Vec<PackageSpec>,
    opts: &'a InstallOptions,
) -> impl Stream<Item = Result<PackageRequest, PkgError>> + 'a {
    let mut dispatch = Dispatch {
        ctx,
        registry,
        opts,
        pending: FuturesUnordered::new(),
        ready: VecDeque::new(),
        emitted: HashSet::new(),
        expanded: HashSet::new(),
        failed: false,
    };
    dispatch.spawn(Expansion::Roots(specs), 0);

    stream::unfold(dispatch, |mut dispatch| async move {
        loop {
            if let Some(request) = dispatch.ready.pop_front() {
                return Some((Ok(request), dispatch));
            }
            if dispatch.failed {
                return None;
            }
            match dispatch.pending.next().await? {
                Ok(requests) => dispatch.accept(requests),
                Err(e) => {
                    dispatch.failed = true;
                    return Some((Err(e), dispatch));
                }
            }
        }
    })
}

async fn expand(
    ctx: &InstallContext,
    registry: Arc<dyn Registry>,
    opts: &InstallOptions,
    expansion: Expansion,
    depth: usize,
) -> Result<Vec<PackageRequest>, PkgError> {
    let (parent_id, specs) = match expansion {
        Expansion::Roots(specs) => (None, specs),
        Expansion::Children {
            parent,
            dev,
            optional,
        } => {
            let specs = parent
                .dependencies
                .iter()
                .map(|(name, range)| {
                    PackageSpec::from_dependency(name, range, &opts.prefix).map(|spec| {
                        let optional =
                            optional || parent.optional_dependencies.contains_key(name);
                        spec.with_flags(dev, optional)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            (Some(parent.id), specs)
        }
    };

    let results = join_all(
        specs
            .into_iter()
            .map(|spec| resolve_one(ctx, registry.as_ref(), opts, parent_id.as_deref(), spec, depth)),
    )
    .await;

    let mut requests = Vec::new();
    for result in results {
        if let Some(request) = result? {
            requests.push(request);
        }
    }

    if let Some(parent_id) = &parent_id {
        let children = requests
            .iter()
            .map(|r| (r.name.clone(), r.package_id.clone()))
            .collect();
        ctx.set_children(parent_id, children);
    }
    Ok(requests)
}

async fn resolve_one(
    ctx: &InstallContext,
    registry: &dyn Registry,
    opts: &InstallOptions,
    parent_id: Option<&str>,
    spec: PackageSpec,
    depth: usize,
) -> Result<Option<PackageRequest>, PkgError> {
    let resolved = match locked_package(ctx, &spec, parent_id, depth, opts) {
        Some(pkg) => {
            debug!(pkg_id = %pkg.id, depth, "reusing locked version");
            Ok(pkg)
        }
        None => registry.resolve(&spec).await,
    };

    let pkg = match resolved {
        Ok(pkg) => pkg,
        Err(e) if spec.optional => {
            warn!(spec = %spec.raw, error = %e, "Skipping failed optional dependency {}", spec.raw);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if ctx.installed(&pkg.id).is_none() {
        let installable = is_installable(
            &pkg,
            spec.optional,
            opts.engine_strict,
            opts.node_version.as_deref(),
        )?;
        if ctx.register(pkg.clone(), installable) {
            if pkg.is_local() {
                ctx.add_local_package(LocalPackage {
                    spec_raw: spec.raw.clone(),
                    package: pkg.clone(),
                });
            } else if installable && !ctx.is_skipped(&pkg.id) {
                ctx.fetch(&pkg);
            }
        }
    }
    let installable = ctx.installed(&pkg.id).is_some_and(|p| p.installable);
    ctx.note_edge(&pkg.id, spec.dev, spec.optional);

    let name = if spec.name.is_empty() {
        pkg.name.clone()
    } else {
        spec.name.clone()
    };
    Ok(Some(PackageRequest {
        spec,
        name,
        depth,
        package_id: pkg.id,
        installable,
        parent_id: parent_id.map(str::to_string),
    }))
}

/// Locked package satisfying `spec`, if one may be reused at `depth`.
///
/// The dependent's own lock entry is tried first. Otherwise the highest
/// locked version of the same name that satisfies the spec is taken, so a
/// re-resolved parent keeps its children's versions.
fn locked_package(
    ctx: &InstallContext,
    spec: &PackageSpec,
    parent_id: Option<&str>,
    depth: usize,
    opts: &InstallOptions,
) -> Option<ResolvedPackage> {
    if opts.updates_at(depth) || spec.spec_type == SpecType::Directory {
        return None;
    }
    let lockfiles = &ctx.lockfiles;
    let entry = |id: &str| {
        lockfiles
            .public
            .packages
            .get(id)
            .or_else(|| lockfiles.private.packages.get(id))
    };
    let accepts = |pkg: &LockPackage| {
        spec.spec_type == SpecType::Tag || version_satisfies(&pkg.version, &spec.fetch_spec)
    };

    let reference = match parent_id {
        None => lockfiles.public.root_references().get(&spec.name).cloned(),
        Some(parent) => entry(parent).and_then(|p| {
            p.dependencies
                .get(&spec.name)
                .or_else(|| p.optional_dependencies.get(&spec.name))
                .cloned()
        }),
    };
    if let Some(reference) = reference {
        let id = dependency_id(&spec.name, &reference);
        if let Some(pkg) = entry(&id).filter(|p| !id.starts_with("link:") && accepts(*p)) {
            return Some(pkg.to_resolved(&id));
        }
    }

    if spec.spec_type == SpecType::Tag {
        return None;
    }
    let candidates: Vec<(&String, &LockPackage)> = lockfiles
        .public
        .packages
        .iter()
        .chain(&lockfiles.private.packages)
        .filter(|(id, p)| p.name == spec.name && !id.starts_with("link:"))
        .collect();
    let best = max_satisfying(
        candidates.iter().map(|(_, p)| p.version.as_str()),
        &spec.fetch_spec,
    )
    .ok()
    .flatten()?;
    candidates
        .into_iter()
        .find(|(_, p)| p.version == best)
        .map(|(id, p)| p.to_resolved(id))
}
