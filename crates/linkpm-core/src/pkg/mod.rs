//! Package primitives used by the install engine.
//!
//! Provides:
//! - Parsing package specs (`name@range`, directories)
//! - npm range matching
//! - Reading and writing `package.json`
//! - Resolving specs against the npm registry
//! - Downloading, verifying and extracting tarballs into the store
//! - Public/private lockfile documents
//! - `node_modules/.modules.json` metadata
//! - Symlink/junction and hard-link helpers for `node_modules`

pub mod error;
pub mod link;
pub mod lockfile;
pub mod manifest;
pub mod modules;
pub mod package;
pub mod registry;
pub mod spec;
pub mod store;
pub mod tarball;
pub mod version;

pub use error::{codes as pkg_codes, PkgError};
pub use lockfile::{
    codes as lockfile_codes, LockPackage, LockResolution, Lockfile, LockfileError, LockfilePair,
    LOCKFILE_NAME, PRIVATE_LOCKFILE_NAME,
};
pub use manifest::{read_manifest, write_manifest, Manifest, SaveType, MANIFEST_NAME};
pub use modules::{read_modules, write_modules, ModulesMeta, LAYOUT_VERSION};
pub use package::{Resolution, ResolvedPackage};
pub use registry::{NpmRegistry, Registry, DEFAULT_REGISTRY, REGISTRY_ENV};
pub use spec::{PackageSpec, SpecType};
pub use store::{FsStore, PackageContent, PackageStore};
pub use version::{max_satisfying, version_satisfies};
