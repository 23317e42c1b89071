//! Persisting the results of a run.

use super::context::InstallContext;
use crate::pkg::lockfile::write_pair;
use crate::pkg::{write_manifest, write_modules, Lockfile, Manifest, ModulesMeta, PkgError, MANIFEST_NAME};
use crate::version::package_manager_id;
use futures::future::try_join;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What gets written at the end of a run.
pub struct Finalize<'a> {
    pub root: &'a Path,
    /// Written only when set.
    pub manifest: Option<Manifest>,
    pub shrinkwrap: Lockfile,
    pub private_shrinkwrap: Lockfile,
    pub store: PathBuf,
    pub independent_leaves: bool,
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, PkgError> + Send + 'static,
) -> Result<T, PkgError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PkgError::store_error(format!("Write task failed: {e}")))?
}

/// Write the manifest and both lockfiles, then `.modules.json`, then wait
/// for every fetch this run started.
///
/// # Errors
/// Returns the first write error, or an integrity error of a package that
/// was not skipped.
pub async fn finalize(ctx: &InstallContext, out: Finalize<'_>) -> Result<(), PkgError> {
    let root = out.root.to_path_buf();

    let manifest_write = {
        let path = root.join(MANIFEST_NAME);
        let manifest = out.manifest;
        blocking(move || match manifest {
            Some(manifest) => write_manifest(&path, &manifest),
            None => Ok(()),
        })
    };
    let lockfile_write = {
        let root = root.clone();
        let public = out.shrinkwrap;
        let private = out.private_shrinkwrap;
        blocking(move || write_pair(&root, &public, &private).map_err(PkgError::from))
    };
    try_join(manifest_write, lockfile_write).await?;

    let meta = ModulesMeta {
        package_manager: package_manager_id(),
        store: out.store,
        skipped: ctx.skipped().into_iter().collect(),
        layout_version: crate::pkg::LAYOUT_VERSION,
        independent_leaves: out.independent_leaves,
    };
    let node_modules = crate::paths::node_modules(&root);
    blocking(move || {
        std::fs::create_dir_all(&node_modules)?;
        write_modules(&node_modules, &meta)
    })
    .await?;

    await_outstanding(ctx).await
}

/// Wait for fetches of skipped packages, ignoring their errors, then for
/// the integrity of every package fetched this run.
///
/// # Errors
/// Returns the first integrity failure of a package that is not skipped.
pub async fn await_outstanding(ctx: &InstallContext) -> Result<(), PkgError> {
    let records = ctx.fetch_records();

    for (id, record) in &records {
        if ctx.is_skipped(id) {
            if let Err(e) = record.files.clone().await {
                debug!(pkg_id = %id, error = %e, "ignoring fetch failure of skipped package");
            }
        }
    }

    for (id, record) in records {
        let result = record.integrity.await;
        if ctx.is_skipped(&id) {
            continue;
        }
        result?;
    }
    Ok(())
}
