#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use commands::{InstallArgs, SharedArgs};
use linkpm_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "linkpm")]
#[command(author, version, about = "A package manager that links node_modules from a shared store", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Install the project's dependencies, or add the given packages
    #[command(alias = "i", alias = "add")]
    Install {
        /// Packages to add (e.g. `lodash`, `react@^18`, `file:../lib`)
        packages: Vec<String>,

        #[command(flatten)]
        install: InstallArgs,

        #[command(flatten)]
        shared: SharedArgs,
    },

    /// Remove packages from the project
    #[command(alias = "rm", alias = "remove")]
    Uninstall {
        /// Packages to remove
        #[arg(required = true)]
        packages: Vec<String>,

        /// Remove from devDependencies only
        #[arg(short = 'D', long)]
        save_dev: bool,

        /// Remove from optionalDependencies only
        #[arg(short = 'O', long)]
        save_optional: bool,

        #[command(flatten)]
        shared: SharedArgs,
    },

    /// Symlink a local package directory into node_modules
    #[command(alias = "ln")]
    Link {
        /// Package directory
        dir: PathBuf,

        #[command(flatten)]
        shared: SharedArgs,
    },

    /// Remove external links from node_modules
    Unlink {
        /// Links to remove (default: every external link)
        packages: Vec<String>,

        #[command(flatten)]
        shared: SharedArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine working directory
    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::new(cwd.clone())
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(),
        Some(Commands::Install {
            packages,
            install,
            shared,
        }) => {
            let span = tracing::info_span!("install", cmd = "install", cwd = %cwd.display());
            let _guard = span.enter();
            commands::install::run(&config, &packages, &install, &shared, cli.json)
        }
        Some(Commands::Uninstall {
            packages,
            save_dev,
            save_optional,
            shared,
        }) => {
            let span = tracing::info_span!("uninstall", cmd = "uninstall", cwd = %cwd.display());
            let _guard = span.enter();
            commands::uninstall::run(&config, &packages, save_dev, save_optional, &shared, cli.json)
        }
        Some(Commands::Link { dir, shared }) => {
            let span = tracing::info_span!("link", cmd = "link", cwd = %cwd.display());
            let _guard = span.enter();
            commands::link::link(&config, &dir, &shared, cli.json)
        }
        Some(Commands::Unlink { packages, shared }) => {
            let span = tracing::info_span!("unlink", cmd = "unlink", cwd = %cwd.display());
            let _guard = span.enter();
            commands::link::unlink(&config, &packages, &shared, cli.json)
        }
    }
}
