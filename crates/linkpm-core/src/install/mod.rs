//! The install engine.
//!
//! A run goes through these stages:
//! 1. Take the run lock on the project
//! 2. Resolve the requested specs and everything they reach (`request`)
//! 3. Build the dependency tree (`tree`)
//! 4. Reconcile the public and private lockfiles (`reconcile`)
//! 5. Link `node_modules` (`link`)
//! 6. Run lifecycle scripts of newly linked packages (`lifecycle`)
//! 7. Persist the manifest, lockfiles and `.modules.json` (`finalize`)

pub mod api;
pub mod checks;
pub mod context;
pub mod finalize;
pub mod lifecycle;
pub mod link;
pub mod options;
pub mod project;
pub mod reconcile;
pub mod request;
pub mod run_lock;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{InstallSummary, Installer};
pub use checks::is_installable;
pub use context::{FetchRecord, InstallContext, InstalledPackage, LocalPackage};
pub use lifecycle::{ScriptRunner, ShellScriptRunner};
pub use link::{LinkOutcome, LinkRequest, Linker, NodeModulesLinker};
pub use options::{InstallOptions, RetryPolicy};
pub use project::ProjectContext;
pub use reconcile::RootDependency;
pub use request::{request_packages, PackageRequest};
pub use run_lock::{with_lock, RunLock};
pub use tree::{DependencyTree, NodeIndex, TreeNode};
