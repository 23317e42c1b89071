//! Keeping the public and private lockfiles in step with a run.

use super::context::InstallContext;
use crate::pkg::lockfile::reference_of;
use crate::pkg::{LockPackage, Lockfile, LockfilePair, Manifest};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A direct dependency of the project as resolved this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDependency {
    pub name: String,
    pub package_id: String,
    pub dev: bool,
    pub optional: bool,
}

/// Whether two lockfiles lock the same packages.
///
/// Compares every entry in full, child references included.
#[must_use]
pub fn lockfiles_equal(a: &Lockfile, b: &Lockfile) -> bool {
    a.packages == b.packages
}

/// Whether the private lockfile should be updated in place instead of
/// replaced by the public one.
///
/// Only runs that touch a subset of the dependencies (named installs and
/// uninstalls) qualify, and only when `node_modules` does not already
/// match the public lockfile.
#[must_use]
pub fn needs_partial_private(subset_run: bool, pair: &LockfilePair) -> bool {
    subset_run
        && ((pair.public_exists && !pair.private_exists)
            || !lockfiles_equal(&pair.public, &pair.private))
}

/// Drop root entries whose specifier no longer matches `package.json`, so
/// they are resolved again.
pub fn drop_stale_root_entries(lock: &mut Lockfile, manifest: &Manifest) {
    let declared = manifest.all_dependencies();
    let stale: Vec<String> = lock
        .root_references()
        .into_keys()
        .filter(|name| declared.get(name) != lock.specifiers.get(name))
        .collect();
    for name in stale {
        lock.remove_root(&name);
    }
}

/// Make the root sections mirror `package.json`.
///
/// Specifiers are copied over, names no longer declared are removed, and
/// each remaining reference moves to the section its dependency is
/// declared in.
pub fn sync_with_manifest(lock: &mut Lockfile, manifest: &Manifest) {
    lock.specifiers = manifest.all_dependencies();
    let references = lock.root_references();
    lock.dependencies.clear();
    lock.dev_dependencies.clear();
    lock.optional_dependencies.clear();

    for (name, reference) in references {
        if !lock.specifiers.contains_key(&name) {
            continue;
        }
        let section = if manifest.optional_dependencies.contains_key(&name) {
            &mut lock.optional_dependencies
        } else if manifest.dependencies.contains_key(&name) {
            &mut lock.dependencies
        } else {
            &mut lock.dev_dependencies
        };
        section.insert(name, reference);
    }
}

/// Record every package resolved this run and the given roots.
pub fn merge_resolved(lock: &mut Lockfile, ctx: &InstallContext, roots: &[RootDependency]) {
    for (id, installed) in ctx.installs() {
        lock.packages.insert(
            id,
            LockPackage::from_resolved(&installed.package, &installed.child_names),
        );
    }

    for root in roots {
        let reference = reference_of(&root.name, &root.package_id);
        lock.dependencies.remove(&root.name);
        lock.dev_dependencies.remove(&root.name);
        lock.optional_dependencies.remove(&root.name);
        let section = if root.optional {
            &mut lock.optional_dependencies
        } else if root.dev {
            &mut lock.dev_dependencies
        } else {
            &mut lock.dependencies
        };
        section.insert(root.name.clone(), reference);
    }
}

/// Remove packages the roots no longer reach and recompute the `dev` and
/// `optional` flags of the rest.
pub fn prune(lock: &mut Lockfile) {
    let mut stack: Vec<(String, bool, bool)> = Vec::new();
    let sections = [
        (&lock.dependencies, false, false),
        (&lock.dev_dependencies, true, false),
        (&lock.optional_dependencies, false, true),
    ];
    for (section, dev, optional) in sections {
        for (name, reference) in section {
            stack.push((
                crate::pkg::lockfile::dependency_id(name, reference),
                dev,
                optional,
            ));
        }
    }

    let mut seen: HashSet<(String, bool, bool)> = HashSet::new();
    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut non_dev: HashSet<String> = HashSet::new();
    let mut non_optional: HashSet<String> = HashSet::new();

    while let Some((id, dev, optional)) = stack.pop() {
        if !seen.insert((id.clone(), dev, optional)) {
            continue;
        }
        let Some(entry) = lock.packages.get(&id) else {
            continue;
        };
        reachable.insert(id.clone());
        if !dev {
            non_dev.insert(id.clone());
        }
        if !optional {
            non_optional.insert(id.clone());
        }
        for (name, reference) in &entry.dependencies {
            stack.push((crate::pkg::lockfile::dependency_id(name, reference), dev, optional));
        }
        for (name, reference) in &entry.optional_dependencies {
            stack.push((crate::pkg::lockfile::dependency_id(name, reference), dev, true));
        }
    }

    lock.packages.retain(|id, _| reachable.contains(id));
    for (id, entry) in &mut lock.packages {
        entry.dev = !non_dev.contains(id);
        entry.optional = !non_optional.contains(id);
    }
}

/// The private lockfile to write after a run.
///
/// A full run makes it a copy of the public lockfile. A partial run keeps
/// the existing entries, takes the roots and every `touched` entry from
/// the public lockfile, and fills in whatever else the roots reach.
#[must_use]
pub fn next_private(
    partial: bool,
    public: &Lockfile,
    private: &Lockfile,
    touched: &BTreeSet<String>,
) -> Lockfile {
    if !partial {
        return public.clone();
    }

    let mut next = private.clone();
    next.registry.clone_from(&public.registry);
    next.specifiers.clone_from(&public.specifiers);
    next.dependencies.clone_from(&public.dependencies);
    next.dev_dependencies.clone_from(&public.dev_dependencies);
    next.optional_dependencies.clone_from(&public.optional_dependencies);

    for id in touched {
        if let Some(entry) = public.packages.get(id) {
            next.packages.insert(id.clone(), entry.clone());
        }
    }

    let mut stack: Vec<String> = next
        .root_references()
        .iter()
        .map(|(name, reference)| crate::pkg::lockfile::dependency_id(name, reference))
        .collect();
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if !next.packages.contains_key(&id) {
            if let Some(entry) = public.packages.get(&id) {
                next.packages.insert(id.clone(), entry.clone());
            }
        }
        if let Some(entry) = next.packages.get(&id) {
            stack.extend(entry.child_ids());
        }
    }

    prune(&mut next);
    next
}

/// Root dependency flags by name, for requests that carry none.
#[must_use]
pub fn root_flags(manifest: &Manifest) -> BTreeMap<String, (bool, bool)> {
    manifest
        .all_dependencies()
        .into_keys()
        .map(|name| {
            let optional = manifest.optional_dependencies.contains_key(&name);
            let dev = !optional
                && !manifest.dependencies.contains_key(&name)
                && manifest.dev_dependencies.contains_key(&name);
            (name, (dev, optional))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::testing::registry_package;

    fn entry(name: &str, version: &str, deps: &[(&str, &str)]) -> LockPackage {
        let children = deps
            .iter()
            .map(|(n, v)| ((*n).to_string(), format!("/{n}/{v}")))
            .collect();
        LockPackage::from_resolved(&registry_package(name, version, deps), &children)
    }

    fn lock_with(entries: &[(&str, &str, &[(&str, &str)])]) -> Lockfile {
        let mut lock = Lockfile::default();
        for (name, version, deps) in entries {
            lock.packages
                .insert(format!("/{name}/{version}"), entry(name, version, deps));
        }
        lock
    }

    fn manifest(json: &str) -> Manifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_equality_compares_children() {
        let a = lock_with(&[("a", "1.0.0", &[("b", "1.0.0")]), ("b", "1.0.0", &[])]);
        let mut b = a.clone();
        assert!(lockfiles_equal(&a, &b));

        b.packages
            .get_mut("/a/1.0.0")
            .unwrap()
            .dependencies
            .insert("b".into(), "2.0.0".into());
        assert!(!lockfiles_equal(&a, &b));
    }

    #[test]
    fn test_partial_only_for_subset_runs() {
        let public = lock_with(&[("a", "1.0.0", &[])]);
        let pair = LockfilePair {
            public,
            private: Lockfile::default(),
            public_exists: true,
            private_exists: false,
        };
        assert!(needs_partial_private(true, &pair));
        assert!(!needs_partial_private(false, &pair));

        let same = LockfilePair {
            private: pair.public.clone(),
            private_exists: true,
            ..pair
        };
        assert!(!needs_partial_private(true, &same));
    }

    #[test]
    fn test_drop_stale_root_entries() {
        let mut lock = Lockfile::default();
        lock.specifiers.insert("a".into(), "^1.0.0".into());
        lock.specifiers.insert("b".into(), "^1.0.0".into());
        lock.dependencies.insert("a".into(), "1.0.0".into());
        lock.dependencies.insert("b".into(), "1.0.0".into());

        let m = manifest(r#"{"dependencies": {"a": "^1.0.0", "b": "^2.0.0"}}"#);
        drop_stale_root_entries(&mut lock, &m);

        assert!(lock.dependencies.contains_key("a"));
        assert!(!lock.dependencies.contains_key("b"));
        assert!(!lock.specifiers.contains_key("b"));
    }

    #[test]
    fn test_sync_moves_sections_and_drops_undeclared() {
        let mut lock = Lockfile::default();
        lock.dependencies.insert("a".into(), "1.0.0".into());
        lock.dependencies.insert("gone".into(), "1.0.0".into());

        let m = manifest(r#"{"devDependencies": {"a": "^1.0.0"}}"#);
        sync_with_manifest(&mut lock, &m);

        assert_eq!(lock.dev_dependencies["a"], "1.0.0");
        assert!(lock.dependencies.is_empty());
        assert_eq!(lock.specifiers["a"], "^1.0.0");
    }

    #[test]
    fn test_prune_removes_unreachable_and_sets_flags() {
        let mut lock = lock_with(&[
            ("a", "1.0.0", &[("c", "1.0.0")]),
            ("d", "1.0.0", &[("c", "1.0.0")]),
            ("c", "1.0.0", &[]),
            ("orphan", "1.0.0", &[]),
        ]);
        lock.dependencies.insert("a".into(), "1.0.0".into());
        lock.dev_dependencies.insert("d".into(), "1.0.0".into());

        prune(&mut lock);

        assert!(!lock.packages.contains_key("/orphan/1.0.0"));
        assert!(lock.packages["/d/1.0.0"].dev);
        assert!(!lock.packages["/c/1.0.0"].dev);
        assert!(!lock.packages["/a/1.0.0"].optional);
    }

    #[test]
    fn test_next_private_full_copies_public() {
        let public = lock_with(&[("a", "1.0.0", &[])]);
        let private = lock_with(&[("b", "1.0.0", &[])]);
        assert_eq!(next_private(false, &public, &private, &BTreeSet::new()), public);
    }

    #[test]
    fn test_next_private_partial_keeps_untouched_entries() {
        let mut public = lock_with(&[("a", "2.0.0", &[]), ("b", "1.0.0", &[])]);
        public.dependencies.insert("a".into(), "2.0.0".into());
        public.dependencies.insert("b".into(), "1.0.0".into());

        // node_modules still has the older b
        let mut private = lock_with(&[("b", "0.9.0", &[])]);
        private.dependencies.insert("b".into(), "0.9.0".into());

        let touched = BTreeSet::from(["/a/2.0.0".to_string()]);
        let next = next_private(true, &public, &private, &touched);

        assert!(next.packages.contains_key("/a/2.0.0"));
        assert!(next.packages.contains_key("/b/1.0.0"));
        assert_eq!(next.dependencies["a"], "2.0.0");
        assert!(!next.packages.contains_key("/b/0.9.0"));
    }

    #[test]
    fn test_root_flags() {
        let m = manifest(
            r#"{"dependencies": {"a": "1"}, "devDependencies": {"b": "1"}, "optionalDependencies": {"c": "1"}}"#,
        );
        let flags = root_flags(&m);
        assert_eq!(flags["a"], (false, false));
        assert_eq!(flags["b"], (true, false));
        assert_eq!(flags["c"], (false, true));
    }
}
