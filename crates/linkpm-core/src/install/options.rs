//! Options shared by every install entry point.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backoff schedule for acquiring the run lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub retries: u32,
    #[serde(with = "millis")]
    pub min_timeout: Duration,
    #[serde(with = "millis")]
    pub max_timeout: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 20,
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(2),
            factor: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.min_timeout.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_timeout.as_secs_f64()))
    }
}

/// Options for `install`, `install_pkgs`, `uninstall`, `link` and `unlink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallOptions {
    /// Hold the project and store run locks for the duration of the call.
    pub lock: bool,
    /// Lock markers older than this are considered abandoned.
    #[serde(with = "millis")]
    pub lock_stale_duration: Duration,
    pub retry: RetryPolicy,
    /// Project directory.
    pub prefix: PathBuf,
    /// Store location. Defaults to the platform cache dir.
    pub store_path: Option<PathBuf>,
    /// Proceed even if `node_modules` was built against another store.
    pub force: bool,
    /// Re-resolve dependencies up to this depth when updating. Negative
    /// means never.
    pub depth: i64,
    /// Ignore locked versions up to `depth`. Unset means "entry point default".
    pub update: Option<bool>,
    /// Never touch the network.
    pub offline: bool,
    /// Engine and platform mismatches are errors.
    pub engine_strict: bool,
    /// Maximum concurrent lifecycle scripts.
    pub child_concurrency: usize,
    /// Maximum packages the linker awaits from the store and materialises
    /// into `node_modules` at once.
    pub network_concurrency: usize,
    /// Symlink dependency-free packages straight from the store.
    pub independent_leaves: bool,
    pub save_exact: bool,
    pub save_dev: bool,
    pub save_optional: bool,
    /// Dist-tag used for bare names.
    pub tag: String,
    /// Skip dev-only packages when linking.
    pub production: bool,
    /// Link optional-only packages.
    pub optional: bool,
    /// Do not run lifecycle scripts.
    pub ignore_scripts: bool,
    /// Node.js version checked against `engines.node`.
    pub node_version: Option<String>,
    /// Registry URL. Defaults to `LINKPM_NPM_REGISTRY` or npmjs.
    pub registry: Option<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            lock: true,
            lock_stale_duration: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            prefix: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            store_path: None,
            force: false,
            depth: 0,
            update: None,
            offline: false,
            engine_strict: false,
            child_concurrency: 5,
            network_concurrency: 16,
            independent_leaves: false,
            save_exact: false,
            save_dev: false,
            save_optional: false,
            tag: crate::pkg::spec::DEFAULT_TAG.to_string(),
            production: false,
            optional: true,
            ignore_scripts: false,
            node_version: None,
            registry: None,
        }
    }
}

impl InstallOptions {
    /// Options for the project at `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| Error::OptionsParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the store location.
    #[must_use]
    pub fn with_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store_path = Some(store.into());
        self
    }

    /// Set the registry URL.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Enable or disable the run lock.
    #[must_use]
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Set the update flag and depth.
    #[must_use]
    pub fn with_update(mut self, update: bool, depth: i64) -> Self {
        self.update = Some(update);
        self.depth = depth;
        self
    }

    /// Set the Node.js version used for `engines` checks.
    #[must_use]
    pub fn with_node_version(mut self, version: impl Into<String>) -> Self {
        self.node_version = Some(version.into());
        self
    }

    /// Effective store path.
    #[must_use]
    pub fn store(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(crate::paths::store_dir)
    }

    /// Effective registry URL.
    #[must_use]
    pub fn registry_url(&self) -> String {
        self.registry.clone().unwrap_or_else(|| {
            std::env::var(crate::pkg::REGISTRY_ENV)
                .unwrap_or_else(|_| crate::pkg::DEFAULT_REGISTRY.to_string())
        })
    }

    /// Whether depth `depth` re-resolves instead of reusing locked versions.
    #[must_use]
    pub fn updates_at(&self, depth: usize) -> bool {
        self.update.unwrap_or(false) && i64::try_from(depth).is_ok_and(|d| d <= self.depth)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let opts = InstallOptions::new("/p");
        assert!(opts.lock);
        assert_eq!(opts.tag, "latest");
        assert_eq!(opts.child_concurrency, 5);
        assert!(opts.optional);
        assert!(!opts.updates_at(0));
    }

    #[test]
    fn test_updates_at_depth() {
        let opts = InstallOptions::new("/p").with_update(true, 0);
        assert!(opts.updates_at(0));
        assert!(!opts.updates_at(1));

        let never = InstallOptions::new("/p").with_update(true, -1);
        assert!(!never.updates_at(0));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            retries: 5,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_millis(300),
            factor: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(5), Duration::from_millis(300));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linkpm.json");
        std::fs::write(
            &path,
            r#"{"saveExact": true, "lockStaleDuration": 500, "retry": {"retries": 1}}"#,
        )
        .unwrap();

        let opts = InstallOptions::load(&path).unwrap();
        assert!(opts.save_exact);
        assert_eq!(opts.lock_stale_duration, Duration::from_millis(500));
        assert_eq!(opts.retry.retries, 1);
        assert_eq!(opts.retry.factor, 1.5);
        assert!(opts.lock);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linkpm.json");
        std::fs::write(&path, "{").unwrap();
        let err = InstallOptions::load(&path).unwrap_err();
        assert_eq!(err.code(), "OPTIONS_INVALID");
    }
}
