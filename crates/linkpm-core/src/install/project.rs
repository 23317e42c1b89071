//! What an install run knows about the project before it starts.

use super::options::InstallOptions;
use crate::pkg::lockfile::read_pair;
use crate::pkg::{read_manifest, read_modules, LockfilePair, Manifest, ModulesMeta, PkgError};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

/// Project state read at the start of a run.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub root: PathBuf,
    /// `None` when the project has no `package.json`.
    pub manifest: Option<Manifest>,
    pub store: PathBuf,
    pub lockfiles: LockfilePair,
    /// `.modules.json` of the previous run.
    pub modules: Option<ModulesMeta>,
    /// Package ids the previous run skipped.
    pub skipped: BTreeSet<String>,
}

impl ProjectContext {
    /// Read the manifest, both lockfiles and `.modules.json`.
    ///
    /// # Errors
    /// Returns `PKG_STORE_MISMATCH` when `node_modules` links into another
    /// store and `force` is off, or any read error.
    pub fn load(opts: &InstallOptions) -> Result<Self, PkgError> {
        let root = opts.prefix.clone();
        let store = opts.store();
        let manifest = read_manifest(&root)?;
        let lockfiles = read_pair(&root, &opts.registry_url())?;
        let modules = read_modules(&crate::paths::node_modules(&root))?;

        if let Some(meta) = &modules {
            if meta.store != store && !opts.force {
                return Err(PkgError::store_mismatch(&meta.store, &store));
            }
        }

        let skipped: BTreeSet<String> = modules
            .as_ref()
            .map(|m| m.skipped.iter().cloned().collect())
            .unwrap_or_default();
        debug!(
            root = %root.display(),
            public_lockfile = lockfiles.public_exists,
            private_lockfile = lockfiles.private_exists,
            skipped = skipped.len(),
            "loaded project"
        );

        Ok(Self {
            root,
            manifest,
            store,
            lockfiles,
            modules,
            skipped,
        })
    }

    /// The manifest, required by every entry point but `link`.
    ///
    /// # Errors
    /// Returns `PKG_MANIFEST_MISSING` if there is none.
    pub fn require_manifest(&self) -> Result<&Manifest, PkgError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| PkgError::manifest_missing(&self.root))
    }
}
