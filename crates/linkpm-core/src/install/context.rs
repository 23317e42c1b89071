//! Per-run shared state.

use super::tree::{ChildSource, DependencyTree};
use crate::pkg::{LockfilePair, PackageContent, PackageStore, PkgError, ResolvedPackage};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A fetch whose result can be awaited by any number of consumers.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, PkgError>>>;

/// In-flight work for one package id.
#[derive(Clone)]
pub struct FetchRecord {
    /// The package's manifest data. Registry resolution already returns
    /// the full manifest, so this is ready as soon as the record exists and
    /// never touches the store.
    pub package: SharedFetch<ResolvedPackage>,
    /// Files available on disk.
    pub files: SharedFetch<PackageContent>,
    /// Store index written for the files.
    pub integrity: SharedFetch<()>,
}

impl FetchRecord {
    /// Record fetching `pkg` through `store`. Nothing runs until polled.
    #[must_use]
    pub fn for_package(pkg: &ResolvedPackage, store: &Arc<dyn PackageStore>) -> Self {
        let package = future::ready(Ok(pkg.clone())).boxed().shared();
        let files = store.fetch_files(pkg).shared();

        let store = Arc::clone(store);
        let integrity = files
            .clone()
            .then(move |content| async move { store.compute_integrity(&content?).await })
            .boxed()
            .shared();

        Self {
            package,
            files,
            integrity,
        }
    }
}

/// A package reached during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package: ResolvedPackage,
    /// Passed the platform/engine checks on first arrival.
    pub installable: bool,
    /// Resolved child ids in declaration order.
    pub children: Vec<String>,
    /// Child name to child id.
    pub child_names: BTreeMap<String, String>,
}

/// A local directory dependency found during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPackage {
    /// Request as written, e.g. `foo@file:../foo`.
    pub spec_raw: String,
    pub package: ResolvedPackage,
}

#[derive(Default)]
struct RunState {
    installs: HashMap<String, InstalledPackage>,
    skipped: BTreeSet<String>,
    non_dev: HashSet<String>,
    non_optional: HashSet<String>,
    local_packages: Vec<LocalPackage>,
}

/// Shared mutable state for one install call.
pub struct InstallContext {
    store: Arc<dyn PackageStore>,
    fetch_locker: Mutex<HashMap<String, FetchRecord>>,
    state: Mutex<RunState>,
    /// Lockfiles as read at the start of the run.
    pub lockfiles: LockfilePair,
    /// Tree built after resolution.
    pub tree: DependencyTree,
}

impl InstallContext {
    /// Fresh context. `skipped` carries the skip set of the previous run.
    #[must_use]
    pub fn new(store: Arc<dyn PackageStore>, lockfiles: LockfilePair, skipped: BTreeSet<String>) -> Self {
        Self {
            store,
            fetch_locker: Mutex::new(HashMap::new()),
            state: Mutex::new(RunState {
                skipped,
                ..RunState::default()
            }),
            lockfiles,
            tree: DependencyTree::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The store packages are fetched into.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    /// Fetch record for `id`, created by `fetch_fn` on first request only.
    pub fn get_or_create_fetch(&self, id: &str, fetch_fn: impl FnOnce() -> FetchRecord) -> FetchRecord {
        let mut locker = self
            .fetch_locker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locker.entry(id.to_string()).or_insert_with(fetch_fn).clone()
    }

    /// Fetch record for `pkg` through the context's store.
    pub fn fetch(&self, pkg: &ResolvedPackage) -> FetchRecord {
        self.get_or_create_fetch(&pkg.id, || FetchRecord::for_package(pkg, &self.store))
    }

    /// All fetch records, by id.
    #[must_use]
    pub fn fetch_records(&self) -> Vec<(String, FetchRecord)> {
        let locker = self
            .fetch_locker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<_> = locker.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// Register a package. Returns `true` on its first arrival this run.
    ///
    /// Ids skipped by an earlier run stay skipped even when the package
    /// now passes its checks.
    pub fn register(&self, package: ResolvedPackage, installable: bool) -> bool {
        let mut state = self.state();
        if state.installs.contains_key(&package.id) {
            return false;
        }
        if !installable {
            state.skipped.insert(package.id.clone());
        }
        state.installs.insert(
            package.id.clone(),
            InstalledPackage {
                package,
                installable,
                children: Vec::new(),
                child_names: BTreeMap::new(),
            },
        );
        true
    }

    /// Already-registered package, if any.
    #[must_use]
    pub fn installed(&self, id: &str) -> Option<InstalledPackage> {
        self.state().installs.get(id).cloned()
    }

    /// Snapshot of every registered package.
    #[must_use]
    pub fn installs(&self) -> HashMap<String, InstalledPackage> {
        self.state().installs.clone()
    }

    /// Record the resolved children of `parent_id`.
    pub fn set_children(&self, parent_id: &str, children: Vec<(String, String)>) {
        let mut state = self.state();
        if let Some(installed) = state.installs.get_mut(parent_id) {
            installed.child_names = children.iter().cloned().collect();
            installed.children = children.into_iter().map(|(_, id)| id).collect();
        }
    }

    /// Note an edge into `id`. Flags are those of the edge.
    pub fn note_edge(&self, id: &str, dev: bool, optional: bool) {
        let mut state = self.state();
        if !dev {
            state.non_dev.insert(id.to_string());
        }
        if !optional {
            state.non_optional.insert(id.to_string());
        }
    }

    /// Push edge flags from the given roots through the resolved graph.
    ///
    /// Children are expanded once per package, so an id first met on a
    /// dev-only path can later turn out to be reachable from production
    /// roots; this walk settles both sets.
    pub fn propagate_edge_flags(&self, roots: &[(String, bool, bool)]) {
        let mut state = self.state();
        let RunState {
            installs,
            non_dev,
            non_optional,
            ..
        } = &mut *state;

        let mut stack: Vec<(String, bool, bool)> = roots.to_vec();
        let mut seen: HashSet<(String, bool, bool)> = HashSet::new();
        while let Some((id, dev, optional)) = stack.pop() {
            if !seen.insert((id.clone(), dev, optional)) {
                continue;
            }
            if !dev {
                non_dev.insert(id.clone());
            }
            if !optional {
                non_optional.insert(id.clone());
            }
            let Some(installed) = installs.get(&id) else {
                continue;
            };
            for (name, child) in &installed.child_names {
                let child_optional =
                    optional || installed.package.optional_dependencies.contains_key(name);
                stack.push((child.clone(), dev, child_optional));
            }
        }
    }

    /// Reached through at least one non-dev edge.
    #[must_use]
    pub fn is_non_dev(&self, id: &str) -> bool {
        self.state().non_dev.contains(id)
    }

    /// Reached through at least one non-optional edge.
    #[must_use]
    pub fn is_non_optional(&self, id: &str) -> bool {
        self.state().non_optional.contains(id)
    }

    /// Exclude `id` from installation.
    pub fn skip(&self, id: &str) {
        self.state().skipped.insert(id.to_string());
    }

    /// Whether `id` is excluded from installation.
    #[must_use]
    pub fn is_skipped(&self, id: &str) -> bool {
        self.state().skipped.contains(id)
    }

    /// Current skip set.
    #[must_use]
    pub fn skipped(&self) -> BTreeSet<String> {
        self.state().skipped.clone()
    }

    /// Record a local directory dependency.
    pub fn add_local_package(&self, local: LocalPackage) {
        let mut state = self.state();
        if !state
            .local_packages
            .iter()
            .any(|l| l.package.id == local.package.id)
        {
            state.local_packages.push(local);
        }
    }

    /// Local directory dependencies found so far.
    #[must_use]
    pub fn local_packages(&self) -> Vec<LocalPackage> {
        self.state().local_packages.clone()
    }
}

impl ChildSource for InstallContext {
    fn child_ids(&self, package_id: &str) -> Vec<String> {
        self.state()
            .installs
            .get(package_id)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    fn is_skipped(&self, package_id: &str) -> bool {
        InstallContext::is_skipped(self, package_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::testing::{registry_package, FakeStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> (InstallContext, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::default());
        let ctx = InstallContext::new(
            store.clone(),
            LockfilePair {
                public: crate::pkg::Lockfile::default(),
                private: crate::pkg::Lockfile::default(),
                public_exists: false,
                private_exists: false,
            },
            BTreeSet::new(),
        );
        (ctx, store)
    }

    #[tokio::test]
    async fn test_fetch_fn_runs_once_per_id() {
        let (ctx, store) = context();
        let pkg = registry_package("foo", "1.0.0", &[]);
        let calls = AtomicUsize::new(0);

        let records: Vec<FetchRecord> = (0..5)
            .map(|_| {
                ctx.get_or_create_fetch(&pkg.id, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    FetchRecord::for_package(&pkg, ctx.store())
                })
            })
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for record in records {
            record.files.await.unwrap();
        }
        assert_eq!(store.fetch_count("/foo/1.0.0"), 1);
    }

    #[tokio::test]
    async fn test_integrity_waits_for_files() {
        let (ctx, store) = context();
        let pkg = registry_package("foo", "1.0.0", &[]);
        let record = ctx.fetch(&pkg);
        assert_eq!(record.package.await.unwrap().id, "/foo/1.0.0");
        assert_eq!(store.fetch_count("/foo/1.0.0"), 0);

        record.integrity.await.unwrap();
        assert_eq!(store.fetch_count("/foo/1.0.0"), 1);
        assert_eq!(store.integrity_count("/foo/1.0.0"), 1);
    }

    #[test]
    fn test_register_first_arrival_and_skip() {
        let (ctx, _) = context();
        let pkg = registry_package("foo", "1.0.0", &[]);
        assert!(ctx.register(pkg.clone(), false));
        assert!(!ctx.register(pkg, true));
        assert!(ctx.is_skipped("/foo/1.0.0"));
        assert!(!ctx.installed("/foo/1.0.0").unwrap().installable);
    }

    #[test]
    fn test_previous_skip_survives_register() {
        let store: Arc<dyn PackageStore> = Arc::new(FakeStore::default());
        let ctx = InstallContext::new(
            store,
            LockfilePair::default(),
            BTreeSet::from(["/foo/1.0.0".to_string()]),
        );
        assert!(ctx.register(registry_package("foo", "1.0.0", &[]), true));
        assert!(ctx.is_skipped("/foo/1.0.0"));
    }

    #[test]
    fn test_edge_flags_propagate() {
        let (ctx, _) = context();
        let a = registry_package("a", "1.0.0", &[("b", "^1.0.0")]);
        let b = registry_package("b", "1.0.0", &[]);
        ctx.register(a, true);
        ctx.register(b, true);
        ctx.set_children("/a/1.0.0", vec![("b".into(), "/b/1.0.0".into())]);

        ctx.propagate_edge_flags(&[("/a/1.0.0".into(), true, false)]);
        assert!(!ctx.is_non_dev("/b/1.0.0"));
        assert!(ctx.is_non_optional("/b/1.0.0"));

        ctx.propagate_edge_flags(&[("/a/1.0.0".into(), false, false)]);
        assert!(ctx.is_non_dev("/b/1.0.0"));
    }
}
