//! `linkpm link` and `linkpm unlink` command implementations.
//!
//! Usage:
//! - `linkpm link <dir>` - Symlink a local package into `node_modules`
//! - `linkpm unlink` - Remove every external link
//! - `linkpm unlink <pkg>...` - Remove the named external links

use super::{block_on, fail, install_options, SharedArgs};
use linkpm_core::{Config, Installer};
use miette::Result;
use std::path::Path;

pub fn link(config: &Config, dir: &Path, shared: &SharedArgs, json: bool) -> Result<()> {
    let opts = install_options(config, shared)?;
    let dir = config.cwd.join(dir);

    let result = block_on(async { Installer::new(&opts)?.link(&dir, &opts).await })?;

    match result {
        Ok(name) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "name": name,
                        "target": dir.display().to_string(),
                    })
                );
            } else {
                println!("Linked {name} -> {}", dir.display());
            }
            Ok(())
        }
        Err(e) => fail(json, e.code(), e.message()),
    }
}

pub fn unlink(config: &Config, packages: &[String], shared: &SharedArgs, json: bool) -> Result<()> {
    let opts = install_options(config, shared)?;

    let result = block_on(async {
        let installer = Installer::new(&opts)?;
        if packages.is_empty() {
            installer.unlink(&opts).await
        } else {
            installer.unlink_pkgs(packages, &opts).await
        }
    })?;

    match result {
        Ok(unlinked) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "unlinked": unlinked,
                    })
                );
            } else if unlinked.is_empty() {
                println!("Nothing to unlink");
            } else {
                for name in &unlinked {
                    println!("Unlinked {name}");
                }
            }
            Ok(())
        }
        Err(e) => fail(json, e.code(), e.message()),
    }
}
