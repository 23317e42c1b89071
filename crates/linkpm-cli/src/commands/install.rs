//! `linkpm install` command implementation.
//!
//! Usage:
//! - `linkpm install` - Install everything `package.json` declares
//! - `linkpm install <pkg>...` - Add packages and save them to `package.json`

use super::{block_on, fail, install_options, InstallArgs, SharedArgs};
use linkpm_core::install::InstallSummary;
use linkpm_core::{Config, Installer};
use miette::Result;
use serde::Serialize;
use tracing::info;

/// Machine-readable result of an install run.
#[derive(Debug, Serialize)]
struct InstallReport<'a> {
    ok: bool,
    resolved: usize,
    added: &'a [String],
    removed: &'a [String],
    skipped: &'a [String],
}

impl<'a> InstallReport<'a> {
    fn new(summary: &'a InstallSummary) -> Self {
        Self {
            ok: true,
            resolved: summary.resolved,
            added: &summary.added,
            removed: &summary.removed,
            skipped: &summary.skipped,
        }
    }
}

pub fn run(
    config: &Config,
    packages: &[String],
    args: &InstallArgs,
    shared: &SharedArgs,
    json: bool,
) -> Result<()> {
    let mut opts = install_options(config, shared)?;
    args.apply(&mut opts);
    info!(packages = packages.len(), "install");

    let result = block_on(async {
        let installer = Installer::new(&opts)?;
        if packages.is_empty() {
            installer.install(&opts).await
        } else {
            installer.install_pkgs(packages, &opts).await
        }
    })?;

    match result {
        Ok(summary) => {
            print_summary(&summary, json);
            Ok(())
        }
        Err(e) => fail(json, e.code(), e.message()),
    }
}

fn print_summary(summary: &InstallSummary, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string(&InstallReport::new(summary)).unwrap_or_default()
        );
        return;
    }

    for id in &summary.added {
        println!("+ {id}");
    }
    for id in &summary.removed {
        println!("- {id}");
    }
    for id in &summary.skipped {
        println!("  skipped {id}");
    }
    println!(
        "Resolved {} package(s), added {}, removed {}",
        summary.resolved,
        summary.added.len(),
        summary.removed.len()
    );
}
