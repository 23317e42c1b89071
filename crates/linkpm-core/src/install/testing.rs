//! In-memory registry, store and script runner for engine tests.

use super::context::InstallContext;
use super::lifecycle::ScriptRunner;
use crate::pkg::package::registry_package_id;
use crate::pkg::registry::resolve_directory;
use crate::pkg::{
    max_satisfying, LockfilePair, PackageContent, PackageSpec, PackageStore, PkgError, Registry,
    Resolution, ResolvedPackage, SpecType,
};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A registry package with the given dependency ranges.
pub fn registry_package(name: &str, version: &str, deps: &[(&str, &str)]) -> ResolvedPackage {
    ResolvedPackage {
        id: registry_package_id(name, version),
        name: name.to_string(),
        version: version.to_string(),
        resolution: Resolution::Registry {
            tarball: format!("https://registry.test/{name}/-/{name}-{version}.tgz"),
            integrity: None,
        },
        dependencies: deps
            .iter()
            .map(|(n, r)| ((*n).to_string(), (*r).to_string()))
            .collect(),
        optional_dependencies: BTreeMap::new(),
        engines: BTreeMap::new(),
        os: Vec::new(),
        cpu: Vec::new(),
        has_scripts: false,
    }
}

/// Fresh context over a [`FakeStore`] with nothing stored.
pub fn context_with(lockfiles: LockfilePair) -> (InstallContext, Arc<FakeStore>) {
    let store = Arc::new(FakeStore::default());
    let ctx = InstallContext::new(store.clone(), lockfiles, BTreeSet::new());
    (ctx, store)
}

/// Registry serving a fixed set of packages.
#[derive(Default)]
pub struct FakeRegistry {
    packages: Vec<ResolvedPackage>,
    resolves: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn with(mut self, pkg: ResolvedPackage) -> Self {
        self.packages.push(pkg);
        self
    }

    /// Raw specs resolved so far.
    pub fn resolves(&self) -> Vec<String> {
        self.resolves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pick(&self, spec: &PackageSpec) -> Result<ResolvedPackage, PkgError> {
        let candidates: Vec<&ResolvedPackage> =
            self.packages.iter().filter(|p| p.name == spec.name).collect();
        if candidates.is_empty() {
            return Err(PkgError::not_found(&spec.name));
        }
        let range = match spec.spec_type {
            SpecType::Tag => "*",
            _ => spec.fetch_spec.as_str(),
        };
        let version = max_satisfying(candidates.iter().map(|p| p.version.as_str()), range)?
            .ok_or_else(|| PkgError::version_not_found(&spec.name, &spec.fetch_spec))?;
        candidates
            .into_iter()
            .find(|p| p.version == version)
            .cloned()
            .ok_or_else(|| PkgError::version_not_found(&spec.name, &spec.fetch_spec))
    }
}

impl Registry for FakeRegistry {
    fn resolve(&self, spec: &PackageSpec) -> BoxFuture<'static, Result<ResolvedPackage, PkgError>> {
        self.resolves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.raw.clone());
        let result = match spec.spec_type {
            SpecType::Directory => resolve_directory(spec),
            _ => self.pick(spec),
        };
        future::ready(result).boxed()
    }
}

#[derive(Default)]
struct StoreCounters {
    fetches: HashMap<String, usize>,
    integrity: HashMap<String, usize>,
}

/// Store that optionally writes each package as a bare `package.json`.
pub struct FakeStore {
    root: PathBuf,
    materialize: bool,
    scripts: HashMap<String, BTreeMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    counters: Arc<Mutex<StoreCounters>>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/fake-store"),
            materialize: false,
            scripts: HashMap::new(),
            failing: Mutex::new(HashSet::new()),
            counters: Arc::default(),
        }
    }
}

impl FakeStore {
    /// Store that writes packages under `root`.
    pub fn in_dir(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            materialize: true,
            ..Self::default()
        }
    }

    /// Give package `id` a script for `event` in its written manifest.
    pub fn with_script(mut self, id: &str, event: &str, script: &str) -> Self {
        self.scripts
            .entry(id.to_string())
            .or_default()
            .insert(event.to_string(), script.to_string());
        self
    }

    /// Make every fetch of `id` fail.
    pub fn fail(&self, id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.fetches.get(id).copied().unwrap_or(0)
    }

    pub fn integrity_count(&self, id: &str) -> usize {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.integrity.get(id).copied().unwrap_or(0)
    }

    fn package_dir(&self, pkg: &ResolvedPackage) -> PathBuf {
        self.root.join(crate::install::link::package_dir_name(&pkg.id))
    }
}

impl PackageStore for FakeStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn fetch_files(&self, pkg: &ResolvedPackage) -> BoxFuture<'static, Result<PackageContent, PkgError>> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pkg.id);
        let counters = Arc::clone(&self.counters);
        let dir = self.package_dir(pkg);
        let manifest = self.materialize.then(|| {
            serde_json::json!({
                "name": pkg.name,
                "version": pkg.version,
                "dependencies": pkg.dependencies,
                "scripts": self.scripts.get(&pkg.id).cloned().unwrap_or_default(),
            })
        });
        let id = pkg.id.clone();

        async move {
            *counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fetches
                .entry(id.clone())
                .or_default() += 1;
            if failing {
                return Err(PkgError::download_failed(format!("{id}: fetch failed")));
            }
            if let Some(manifest) = manifest {
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join("package.json"), manifest.to_string())?;
            }
            Ok(PackageContent {
                id,
                dir,
                from_store: false,
            })
        }
        .boxed()
    }

    fn compute_integrity(&self, content: &PackageContent) -> BoxFuture<'static, Result<(), PkgError>> {
        let counters = Arc::clone(&self.counters);
        let id = content.id.clone();
        async move {
            *counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .integrity
                .entry(id)
                .or_default() += 1;
            Ok(())
        }
        .boxed()
    }
}

/// Script runner that records calls and fails for chosen packages.
#[derive(Default)]
pub struct FakeScriptRunner {
    failing: HashSet<String>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeScriptRunner {
    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// `(package id, event)` of every script run so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ScriptRunner for FakeScriptRunner {
    fn run(
        &self,
        pkg_id: &str,
        _dir: &Path,
        event: &str,
        _script: &str,
    ) -> BoxFuture<'static, Result<(), PkgError>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pkg_id.to_string(), event.to_string()));
        let result = if self.failing.contains(pkg_id) {
            Err(PkgError::lifecycle_failed(pkg_id, event, "Exit code 1"))
        } else {
            Ok(())
        };
        future::ready(result).boxed()
    }
}
