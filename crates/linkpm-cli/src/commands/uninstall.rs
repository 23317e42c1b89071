//! `linkpm uninstall` command implementation.

use super::{block_on, fail, install_options, SharedArgs};
use linkpm_core::{Config, Installer};
use miette::Result;
use tracing::info;

pub fn run(
    config: &Config,
    packages: &[String],
    save_dev: bool,
    save_optional: bool,
    shared: &SharedArgs,
    json: bool,
) -> Result<()> {
    let mut opts = install_options(config, shared)?;
    opts.save_dev = save_dev;
    opts.save_optional = save_optional;
    info!(packages = packages.len(), "uninstall");

    let result = block_on(async {
        Installer::new(&opts)?.uninstall(packages, &opts).await
    })?;

    match result {
        Ok(summary) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "uninstalled": packages,
                        "removed": summary.removed,
                    })
                );
            } else {
                for id in &summary.removed {
                    println!("- {id}");
                }
                println!("Removed {} package(s)", summary.removed.len());
            }
            Ok(())
        }
        Err(e) => fail(json, e.code(), e.message()),
    }
}
