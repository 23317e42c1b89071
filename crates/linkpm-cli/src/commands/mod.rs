pub mod install;
pub mod link;
pub mod uninstall;
pub mod version;

use linkpm_core::paths::project_root;
use linkpm_core::{Config, InstallOptions};
use miette::{miette, IntoDiagnostic, Result};
use std::future::Future;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Options every engine command accepts.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SharedArgs {
    /// Read install options from a JSON file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store directory
    #[arg(long, value_name = "PATH", env = "LINKPM_STORE_DIR")]
    pub store: Option<PathBuf>,

    /// Registry URL
    #[arg(long, value_name = "URL", env = "LINKPM_NPM_REGISTRY")]
    pub registry: Option<String>,

    /// Only use packages already in the store
    #[arg(long)]
    pub offline: bool,

    /// Proceed even if node_modules was built against another store
    #[arg(long)]
    pub force: bool,

    /// Do not take the project and store run locks
    #[arg(long)]
    pub no_lock: bool,

    /// Fail on engine and platform mismatches
    #[arg(long)]
    pub engine_strict: bool,

    /// Node.js version for engines checks (default: `node --version`)
    #[arg(long, value_name = "VERSION")]
    pub node_version: Option<String>,
}

/// Options only `install` accepts.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct InstallArgs {
    /// Save to devDependencies
    #[arg(short = 'D', long)]
    pub save_dev: bool,

    /// Save to optionalDependencies
    #[arg(short = 'O', long)]
    pub save_optional: bool,

    /// Save the exact version instead of a caret range
    #[arg(short = 'E', long)]
    pub save_exact: bool,

    /// Skip devDependencies
    #[arg(short = 'P', long)]
    pub production: bool,

    /// Skip optionalDependencies
    #[arg(long)]
    pub no_optional: bool,

    /// Do not run lifecycle scripts
    #[arg(long)]
    pub ignore_scripts: bool,

    /// Re-resolve instead of reusing locked versions
    #[arg(short, long)]
    pub update: bool,

    /// Deepest level re-resolved by --update
    #[arg(long, value_name = "N")]
    pub depth: Option<i64>,

    /// Dist-tag used for bare package names
    #[arg(long)]
    pub tag: Option<String>,

    /// Link dependency-free packages straight from the store
    #[arg(long)]
    pub independent_leaves: bool,

    /// Maximum concurrent lifecycle scripts
    #[arg(long, value_name = "N")]
    pub child_concurrency: Option<usize>,
}

impl InstallArgs {
    /// Apply the flags that were given on top of `opts`.
    pub fn apply(&self, opts: &mut InstallOptions) {
        opts.save_dev |= self.save_dev;
        opts.save_optional |= self.save_optional;
        opts.save_exact |= self.save_exact;
        opts.production |= self.production;
        opts.ignore_scripts |= self.ignore_scripts;
        opts.independent_leaves |= self.independent_leaves;
        if self.no_optional {
            opts.optional = false;
        }
        if self.update {
            opts.update = Some(true);
        }
        if let Some(depth) = self.depth {
            opts.depth = depth;
        }
        if let Some(tag) = &self.tag {
            opts.tag.clone_from(tag);
        }
        if let Some(n) = self.child_concurrency {
            opts.child_concurrency = n.max(1);
        }
    }
}

/// Build engine options for the project containing `config.cwd`.
///
/// The project is the nearest directory with a `package.json`, or `cwd`
/// itself. The `--config` file supplies the base, flags override it.
pub fn install_options(config: &Config, shared: &SharedArgs) -> Result<InstallOptions> {
    let mut opts = match &shared.config {
        Some(path) => InstallOptions::load(&config.cwd.join(path)).into_diagnostic()?,
        None => InstallOptions::default(),
    };
    opts.prefix = project_root(&config.cwd).unwrap_or_else(|| config.cwd.clone());

    if let Some(store) = &shared.store {
        opts = opts.with_store(config.cwd.join(store));
    }
    if let Some(registry) = &shared.registry {
        opts = opts.with_registry(registry.clone());
    }
    if shared.no_lock {
        opts = opts.with_lock(false);
    }
    opts.offline |= shared.offline;
    opts.force |= shared.force;
    opts.engine_strict |= shared.engine_strict;

    let node_version = shared
        .node_version
        .clone()
        .or_else(|| opts.node_version.take())
        .or_else(detect_node_version);
    if let Some(version) = node_version {
        opts = opts.with_node_version(version);
    }

    debug!(
        prefix = %opts.prefix.display(),
        store = %opts.store().display(),
        registry = %opts.registry_url(),
        node = ?opts.node_version,
        "install options"
    );
    Ok(opts)
}

/// Version of the `node` on PATH, without the leading `v`.
fn detect_node_version() -> Option<String> {
    let node = which::which("node").ok()?;
    let output = Command::new(node).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout);
    let version = version.trim().trim_start_matches('v');
    (!version.is_empty()).then(|| version.to_string())
}

/// Run an engine future to completion.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    Ok(runtime.block_on(future))
}

/// Report a failed command.
///
/// In JSON mode the error is printed to stdout and the process exits with 1.
pub fn fail(json: bool, code: &str, message: &str) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": false,
                "error": {
                    "code": code,
                    "message": message,
                }
            })
        );
        std::process::exit(1);
    }
    Err(miette!("{code}: {message}"))
}
