//! Lifecycle scripts: package post-install hooks and root project hooks.

use super::context::InstallContext;
use crate::pkg::manifest::INSTALL_EVENTS;
use crate::pkg::{read_manifest, Manifest, PkgError};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Command run when a package ships `binding.gyp` without an install script.
const NODE_GYP_REBUILD: &str = "node-gyp rebuild";

/// Runs one lifecycle script.
pub trait ScriptRunner: Send + Sync {
    /// Run `script` for `event` of package `pkg_id` inside `dir`.
    fn run(
        &self,
        pkg_id: &str,
        dir: &Path,
        event: &str,
        script: &str,
    ) -> BoxFuture<'static, Result<(), PkgError>>;
}

/// Runs scripts through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellScriptRunner {
    /// Project `node_modules/.bin`, prepended to `PATH`.
    project_bin: PathBuf,
}

impl ShellScriptRunner {
    /// Runner for the project at `prefix`.
    #[must_use]
    pub fn new(prefix: &Path) -> Self {
        Self {
            project_bin: crate::paths::node_modules(prefix).join(".bin"),
        }
    }

    fn path_env(&self, dir: &Path) -> std::ffi::OsString {
        let mut paths = vec![dir.join("node_modules").join(".bin"), self.project_bin.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).unwrap_or_default()
    }
}

impl ScriptRunner for ShellScriptRunner {
    fn run(
        &self,
        pkg_id: &str,
        dir: &Path,
        event: &str,
        script: &str,
    ) -> BoxFuture<'static, Result<(), PkgError>> {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd.exe", "/C")
        } else {
            ("sh", "-c")
        };
        let mut command = Command::new(shell);
        command
            .arg(shell_arg)
            .arg(script)
            .current_dir(dir)
            .env("PATH", self.path_env(dir))
            .env("npm_lifecycle_event", event)
            .env("npm_lifecycle_script", script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let pkg_id = pkg_id.to_string();
        let event = event.to_string();
        async move {
            info!(pkg_id = %pkg_id, event = %event, "running lifecycle script");
            let mut child = command
                .spawn()
                .map_err(|e| PkgError::lifecycle_failed(&pkg_id, &event, &format!("Failed to spawn: {e}")))?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let (_, tail, status) = tokio::join!(
                log_lines(stdout, &pkg_id, false),
                log_lines(stderr, &pkg_id, true),
                child.wait()
            );
            let status = status.map_err(|e| PkgError::lifecycle_failed(&pkg_id, &event, &e.to_string()))?;

            if status.success() {
                return Ok(());
            }
            let mut detail = format!("Exit code {}", status.code().unwrap_or(-1));
            if !tail.is_empty() {
                detail.push('\n');
                detail.push_str(&Vec::from(tail).join("\n"));
            }
            Err(PkgError::lifecycle_failed(&pkg_id, &event, &detail))
        }
        .boxed()
    }
}

/// Log each output line. Returns the last stderr lines.
async fn log_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    pkg_id: &str,
    is_stderr: bool,
) -> VecDeque<String> {
    let mut tail = VecDeque::new();
    let Some(reader) = reader else {
        return tail;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            error!(pkg_id = %pkg_id, "{line}");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        } else {
            info!(pkg_id = %pkg_id, "{line}");
        }
    }
    tail
}

/// Install-time scripts of the package in `dir`, in run order.
///
/// A package with `binding.gyp` and no `install`/`preinstall` script gets
/// `node-gyp rebuild` as its `install` script.
pub fn install_scripts(dir: &Path, manifest: &Manifest) -> Vec<(&'static str, String)> {
    let mut scripts = manifest.scripts.clone();
    if !scripts.contains_key("install")
        && !scripts.contains_key("preinstall")
        && dir.join("binding.gyp").exists()
    {
        scripts.insert("install".to_string(), NODE_GYP_REBUILD.to_string());
    }
    INSTALL_EVENTS
        .iter()
        .filter_map(|event| scripts.get(*event).map(|s| (*event, s.clone())))
        .collect()
}

/// Run the install-time scripts of one linked package.
///
/// # Errors
/// Returns the first script failure.
pub async fn run_post_install(
    runner: &dyn ScriptRunner,
    pkg_id: &str,
    dir: &Path,
) -> Result<(), PkgError> {
    let Some(manifest) = read_manifest(dir)? else {
        return Ok(());
    };
    for (event, script) in install_scripts(dir, &manifest) {
        runner.run(pkg_id, dir, event, &script).await?;
    }
    Ok(())
}

/// A package whose scripts should run after linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    pub pkg_id: String,
    pub dir: PathBuf,
}

/// Run post-install scripts with at most `child_concurrency` at a time.
///
/// A failure of a package reachable through a required edge stops further
/// queued scripts and is returned once running ones finish. Other failures
/// add the package to the skip set.
///
/// # Errors
/// Returns the first failure of a required package.
pub async fn run_scripts(
    ctx: &InstallContext,
    runner: &dyn ScriptRunner,
    targets: Vec<ScriptTarget>,
    child_concurrency: usize,
) -> Result<(), PkgError> {
    let aborted = AtomicBool::new(false);
    let aborted = &aborted;

    let results: Vec<Result<(), PkgError>> = stream::iter(targets)
        .map(|target| async move {
            if aborted.load(Ordering::SeqCst) {
                debug!(pkg_id = %target.pkg_id, "not running scripts after a failure");
                return Ok(());
            }
            match run_post_install(runner, &target.pkg_id, &target.dir).await {
                Ok(()) => Ok(()),
                Err(e) if ctx.is_non_optional(&target.pkg_id) => {
                    aborted.store(true, Ordering::SeqCst);
                    Err(e)
                }
                Err(e) => {
                    warn!(pkg_id = %target.pkg_id, error = %e, "Skipping failed optional dependency {}", target.pkg_id);
                    ctx.skip(&target.pkg_id);
                    Ok(())
                }
            }
        })
        .buffer_unordered(child_concurrency.max(1))
        .collect()
        .await;

    results.into_iter().collect()
}

/// Project scripts run before the engine.
pub const ROOT_PRE_EVENTS: [&str; 1] = ["preinstall"];

/// Project scripts run after the engine, in order.
pub const ROOT_POST_EVENTS: [&str; 4] = ["install", "postinstall", "prepublish", "prepare"];

/// Run the project's own scripts for `events`.
///
/// # Errors
/// Returns the first script failure.
pub async fn run_root_scripts(
    runner: &dyn ScriptRunner,
    root: &Path,
    manifest: &Manifest,
    events: &[&str],
) -> Result<(), PkgError> {
    let id = manifest.name.clone().unwrap_or_else(|| root.display().to_string());
    for event in events {
        let Some(script) = manifest.scripts.get(*event) else {
            continue;
        };
        // A project `install` script replaces `postinstall`
        if *event == "postinstall" && manifest.scripts.contains_key("install") {
            continue;
        }
        if *event == "prepublish" {
            warn!("`prepublish` scripts are deprecated; use `prepare` for build steps");
        }
        runner.run(&id, root, event, script).await?;
    }
    Ok(())
}
