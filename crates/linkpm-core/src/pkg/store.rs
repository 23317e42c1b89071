//! Content store shared by all projects.
//!
//! Layout:
//! ```text
//! <store>/<name>/<version>/package/         unpacked tarball
//! <store>/<name>/<version>/integrity.json   BLAKE3 digest per file
//! ```

use super::error::PkgError;
use super::package::{Resolution, ResolvedPackage};
use super::tarball::{download_tarball, extract_tgz_atomic, verify_integrity, MAX_TARBALL_SIZE};
use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Name of the per-package file index.
pub const INTEGRITY_FILE: &str = "integrity.json";

/// Package content available on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageContent {
    pub id: String,
    /// Directory holding `package.json` and the package files.
    pub dir: PathBuf,
    /// Already present before this fetch.
    pub from_store: bool,
}

/// Fetches package files into a store and indexes them.
pub trait PackageStore: Send + Sync {
    /// Store root directory.
    fn root(&self) -> &Path;

    /// Make the package's files available on disk.
    fn fetch_files(&self, pkg: &ResolvedPackage) -> BoxFuture<'static, Result<PackageContent, PkgError>>;

    /// Record the content digest of fetched files.
    fn compute_integrity(&self, content: &PackageContent) -> BoxFuture<'static, Result<(), PkgError>>;
}

/// Directory of a registry package in the store.
#[must_use]
pub fn package_dir(store: &Path, name: &str, version: &str) -> PathBuf {
    name.split('/')
        .fold(store.to_path_buf(), |path, part| path.join(part))
        .join(version)
        .join("package")
}

/// Filesystem store backed by registry tarballs.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: Arc<PathBuf>,
    http: Client,
    offline: bool,
}

impl FsStore {
    /// Create a store rooted at `root`, downloading with `http`.
    #[must_use]
    pub fn new(root: PathBuf, http: Client) -> Self {
        Self {
            root: Arc::new(root),
            http,
            offline: false,
        }
    }

    /// Never download; only serve packages already in the store.
    #[must_use]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }
}

impl PackageStore for FsStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn fetch_files(&self, pkg: &ResolvedPackage) -> BoxFuture<'static, Result<PackageContent, PkgError>> {
        let pkg = pkg.clone();
        let root = Arc::clone(&self.root);
        let http = self.http.clone();
        let offline = self.offline;

        async move {
            let (tarball, integrity) = match &pkg.resolution {
                Resolution::Directory { directory } => {
                    return Ok(PackageContent {
                        id: pkg.id.clone(),
                        dir: directory.clone(),
                        from_store: false,
                    })
                }
                Resolution::Git { repo, .. } => {
                    return Err(PkgError::store_error(format!(
                        "{}: git dependencies ({repo}) are not supported",
                        pkg.id
                    )))
                }
                Resolution::Registry { tarball, integrity } => (tarball.clone(), integrity.clone()),
            };

            let dir = package_dir(&root, &pkg.name, &pkg.version);
            if dir.join("package.json").exists() {
                debug!(pkg_id = %pkg.id, "found in store");
                return Ok(PackageContent {
                    id: pkg.id,
                    dir,
                    from_store: true,
                });
            }

            if offline {
                return Err(PkgError::download_failed(format!(
                    "{} is not in the store and the install is offline",
                    pkg.id
                )));
            }

            debug!(pkg_id = %pkg.id, url = %tarball, "downloading");
            let bytes = download_tarball(&http, &tarball, MAX_TARBALL_SIZE).await?;
            if let Some(integrity) = &integrity {
                verify_integrity(&pkg.id, &bytes, integrity)?;
            }

            let dest = dir.clone();
            tokio::task::spawn_blocking(move || extract_tgz_atomic(&bytes, &dest))
                .await
                .map_err(|e| PkgError::extract_failed(format!("Extraction task failed: {e}")))??;

            Ok(PackageContent {
                id: pkg.id,
                dir,
                from_store: false,
            })
        }
        .boxed()
    }

    fn compute_integrity(&self, content: &PackageContent) -> BoxFuture<'static, Result<(), PkgError>> {
        let content = content.clone();
        let root = Arc::clone(&self.root);

        async move {
            // Local directories are not owned by the store
            if !content.dir.starts_with(root.as_path()) {
                return Ok(());
            }
            let Some(version_dir) = content.dir.parent().map(Path::to_path_buf) else {
                return Ok(());
            };
            let index_path = version_dir.join(INTEGRITY_FILE);
            if content.from_store && index_path.exists() {
                return Ok(());
            }

            tokio::task::spawn_blocking(move || {
                let index = linkpm_util::hash::blake3_dir_index(&content.dir)?;
                let json = serde_json::to_vec_pretty(&index)?;
                linkpm_util::fs::atomic_write(&index_path, &json)?;
                Ok::<(), PkgError>(())
            })
            .await
            .map_err(|e| PkgError::store_error(format!("Integrity task failed: {e}")))?
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn registry_pkg(name: &str, version: &str) -> ResolvedPackage {
        ResolvedPackage {
            id: format!("/{name}/{version}"),
            name: name.into(),
            version: version.into(),
            resolution: Resolution::Registry {
                tarball: "http://127.0.0.1:9/unreachable.tgz".into(),
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

    #[test]
    fn test_package_dir_layout() {
        let store = Path::new("/s");
        assert_eq!(
            package_dir(store, "@types/node", "20.0.0"),
            Path::new("/s/@types/node/20.0.0/package")
        );
    }

    #[tokio::test]
    async fn test_fetch_serves_existing_package() {
        let store_dir = tempdir().unwrap();
        let dir = package_dir(store_dir.path(), "foo", "1.0.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.json"), r#"{"name":"foo"}"#).unwrap();

        let store = FsStore::new(store_dir.path().to_path_buf(), Client::new()).with_offline(true);
        let content = store.fetch_files(&registry_pkg("foo", "1.0.0")).await.unwrap();

        assert!(content.from_store);
        assert_eq!(content.dir, dir);

        store.compute_integrity(&content).await.unwrap();
        let index: BTreeMap<String, String> = serde_json::from_str(
            &fs::read_to_string(dir.parent().unwrap().join(INTEGRITY_FILE)).unwrap(),
        )
        .unwrap();
        assert!(index.contains_key("package.json"));
    }

    #[tokio::test]
    async fn test_offline_miss_fails() {
        let store_dir = tempdir().unwrap();
        let store = FsStore::new(store_dir.path().to_path_buf(), Client::new()).with_offline(true);
        let err = store.fetch_files(&registry_pkg("foo", "1.0.0")).await.unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_DOWNLOAD_FAILED);
    }

    #[tokio::test]
    async fn test_directory_packages_are_not_copied() {
        let store_dir = tempdir().unwrap();
        let local = tempdir().unwrap();
        let mut pkg = registry_pkg("local", "0.0.0");
        pkg.id = format!("link:{}", local.path().display());
        pkg.resolution = Resolution::Directory {
            directory: local.path().to_path_buf(),
        };

        let store = FsStore::new(store_dir.path().to_path_buf(), Client::new());
        let content = store.fetch_files(&pkg).await.unwrap();
        assert_eq!(content.dir, local.path());
        assert!(!content.from_store);

        store.compute_integrity(&content).await.unwrap();
        assert!(!local.path().join(INTEGRITY_FILE).exists());
    }
}
