//! npm registry client.

use super::error::PkgError;
use super::manifest::{read_manifest, INSTALL_EVENTS};
use super::package::{local_package_id, registry_package_id, Resolution, ResolvedPackage};
use super::spec::{PackageSpec, SpecType};
use super::version::{max_satisfying, version_satisfies};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "LINKPM_NPM_REGISTRY";

/// Resolves package specs to exact package identities.
pub trait Registry: Send + Sync {
    /// Resolve one spec.
    fn resolve(&self, spec: &PackageSpec) -> BoxFuture<'static, Result<ResolvedPackage, PkgError>>;
}

/// Package metadata document served by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packument {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, PackumentVersion>,
}

/// One version entry of a packument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackumentVersion {
    pub name: String,
    pub version: String,
    #[serde(default, deserialize_with = "lenient")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient")]
    pub os: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub cpu: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub scripts: BTreeMap<String, String>,
    pub dist: Dist,
}

/// Tarball location and checksums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

/// Old packages publish malformed `engines`/`os`/`scripts`; treat those as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl PackumentVersion {
    /// Convert into a resolved package.
    #[must_use]
    pub fn to_resolved(&self) -> ResolvedPackage {
        let mut dependencies = self.dependencies.clone();
        dependencies.extend(self.optional_dependencies.clone());

        ResolvedPackage {
            id: registry_package_id(&self.name, &self.version),
            name: self.name.clone(),
            version: self.version.clone(),
            resolution: Resolution::Registry {
                tarball: self.dist.tarball.clone(),
                integrity: self.dist.integrity.clone().or_else(|| self.dist.shasum.clone()),
            },
            dependencies,
            optional_dependencies: self.optional_dependencies.clone(),
            engines: self.engines.clone(),
            os: self.os.clone(),
            cpu: self.cpu.clone(),
            has_scripts: INSTALL_EVENTS.iter().any(|e| self.scripts.contains_key(*e)),
        }
    }
}

/// Pick the version of `packument` that `spec` asks for.
///
/// Ranges prefer `dist-tags.latest` when it satisfies, then the highest match.
///
/// # Errors
/// Returns an error if nothing matches.
pub fn pick_version<'a>(
    packument: &'a Packument,
    spec: &PackageSpec,
) -> Result<&'a PackumentVersion, PkgError> {
    let name = &packument.name;
    let not_found = || PkgError::version_not_found(name, &spec.fetch_spec);

    let version = match spec.spec_type {
        SpecType::Version => spec.fetch_spec.clone(),
        SpecType::Tag => packument
            .dist_tags
            .get(&spec.fetch_spec)
            .cloned()
            .ok_or_else(not_found)?,
        SpecType::Range => {
            let latest = packument
                .dist_tags
                .get("latest")
                .filter(|v| packument.versions.contains_key(*v))
                .filter(|v| version_satisfies(v, &spec.fetch_spec));
            match latest {
                Some(v) => v.clone(),
                None => max_satisfying(packument.versions.keys().map(String::as_str), &spec.fetch_spec)?
                    .ok_or_else(not_found)?,
            }
        }
        SpecType::Directory => {
            return Err(PkgError::spec_invalid(format!(
                "'{}' is a directory spec, not a registry spec",
                spec.raw
            )))
        }
    };

    packument.versions.get(&version).ok_or_else(not_found)
}

/// Resolve a directory spec by reading the directory's manifest.
///
/// # Errors
/// Returns an error if the directory has no readable `package.json`.
pub fn resolve_directory(spec: &PackageSpec) -> Result<ResolvedPackage, PkgError> {
    let dir = dunce::canonicalize(&spec.fetch_spec)
        .map_err(|_| PkgError::not_found(&spec.fetch_spec))?;
    let manifest = read_manifest(&dir)?.ok_or_else(|| PkgError::manifest_missing(&dir))?;

    let name = manifest
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| spec.name.clone());
    if name.is_empty() {
        return Err(PkgError::package_json_invalid(format!(
            "{} has no name",
            dir.display()
        )));
    }

    let mut dependencies = manifest.dependencies.clone();
    dependencies.extend(manifest.optional_dependencies.clone());

    Ok(ResolvedPackage {
        id: local_package_id(&dir),
        name,
        version: manifest.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
        has_scripts: manifest.has_install_scripts(),
        resolution: Resolution::Directory { directory: dir },
        dependencies,
        optional_dependencies: manifest.optional_dependencies,
        engines: manifest.engines,
        os: manifest.os,
        cpu: manifest.cpu,
    })
}

type PackumentFuture = Shared<BoxFuture<'static, Result<Arc<Packument>, PkgError>>>;

/// Registry client for fetching package metadata.
///
/// Concurrent requests for the same name share one packument fetch.
#[derive(Debug, Clone)]
pub struct NpmRegistry {
    base_url: Url,
    http: Client,
    offline: bool,
    metadata_dir: Option<PathBuf>,
    packuments: Arc<Mutex<HashMap<String, PackumentFuture>>>,
}

impl NpmRegistry {
    /// Create a new registry client with the given base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        let mut normalized = base_url.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized)
            .map_err(|e| PkgError::registry(format!("Invalid registry URL '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("linkpm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http,
            offline: false,
            metadata_dir: None,
            packuments: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Only serve packuments from the metadata cache.
    #[must_use]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Persist fetched packuments under `dir` for offline use.
    #[must_use]
    pub fn with_metadata_cache(mut self, dir: PathBuf) -> Self {
        self.metadata_dir = Some(dir);
        self
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Get the HTTP client (for reuse in tarball downloads).
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Fetch a packument, sharing in-flight and completed fetches.
    pub fn packument(&self, name: &str) -> PackumentFuture {
        let mut map = self
            .packuments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = map.get(name) {
            return existing.clone();
        }

        let this = self.clone();
        let owned = name.to_string();
        let fut = async move { this.load_packument(&owned).await.map(Arc::new) }
            .boxed()
            .shared();
        map.insert(name.to_string(), fut.clone());
        fut
    }

    async fn load_packument(&self, name: &str) -> Result<Packument, PkgError> {
        let cache_path = self.metadata_path(name);

        if self.offline {
            let Some(path) = cache_path else {
                return Err(PkgError::registry(format!(
                    "Cannot fetch '{name}' while offline"
                )));
            };
            let content = tokio::fs::read_to_string(&path).await.map_err(|_| {
                PkgError::registry(format!("'{name}' is not in the offline metadata cache"))
            })?;
            return Ok(serde_json::from_str(&content)?);
        }

        let packument = self.fetch_packument(name).await?;

        if let Some(path) = cache_path {
            if let Ok(json) = serde_json::to_vec(&packument) {
                let written = tokio::task::spawn_blocking(move || {
                    linkpm_util::fs::atomic_write(&path, &json)
                })
                .await;
                if !matches!(written, Ok(Ok(()))) {
                    debug!(name, "failed to cache packument");
                }
            }
        }

        Ok(packument)
    }

    /// Fetch the packument (package metadata) for a package.
    ///
    /// # Errors
    /// Returns an error if the request fails or the package is not found.
    pub async fn fetch_packument(&self, name: &str) -> Result<Packument, PkgError> {
        let encoded_name = if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        };

        let url = self
            .base_url
            .join(&encoded_name)
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))?;

        debug!(name, url = %url, "fetching packument");
        let response = self.http.get(url.as_str()).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }

        if !response.status().is_success() {
            return Err(PkgError::registry(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    fn metadata_path(&self, name: &str) -> Option<PathBuf> {
        self.metadata_dir
            .as_deref()
            .map(|dir: &Path| dir.join(format!("{}.json", name.replace('/', "+"))))
    }
}

impl Registry for NpmRegistry {
    fn resolve(&self, spec: &PackageSpec) -> BoxFuture<'static, Result<ResolvedPackage, PkgError>> {
        let spec = spec.clone();

        if spec.spec_type == SpecType::Directory {
            return async move { resolve_directory(&spec) }.boxed();
        }

        let packument = self.packument(&spec.name);
        async move {
            let packument = packument.await?;
            pick_version(&packument, &spec).map(PackumentVersion::to_resolved)
        }
        .boxed()
    }
}
