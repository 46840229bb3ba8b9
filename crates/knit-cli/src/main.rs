#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

mod commands;
mod logging;

use clap::Parser;
use commands::install::{InstallAction, InstallFlags};
use knit_core::pkg::SaveType;
use knit_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "knit")]
#[command(author, version, about = "A content-addressed node_modules installer", long_about = None)]
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

    /// Install every dependency of the project
    #[command(alias = "i")]
    Install {
        #[command(flatten)]
        flags: InstallFlags,

        /// Re-resolve root dependencies against the registry
        #[arg(long)]
        update: bool,

        /// How deep locked dependencies are re-resolved with --update
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        depth: i64,
    },

    /// Install packages and save them to package.json
    Add {
        /// Package specs: name, name@range, alias@npm:name@range, git or tarball URL, path
        #[arg(required = true)]
        specs: Vec<String>,

        #[command(flatten)]
        flags: InstallFlags,

        /// Save to devDependencies
        #[arg(short = 'D', long, conflicts_with = "save_optional")]
        save_dev: bool,

        /// Save to optionalDependencies
        #[arg(short = 'O', long)]
        save_optional: bool,

        /// Save the exact version instead of a caret range
        #[arg(short = 'E', long)]
        save_exact: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::new(cwd)
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(),
        Some(Commands::Install {
            flags,
            update,
            depth,
        }) => {
            let span = tracing::info_span!("install", cmd = "install", cwd = %config.cwd.display());
            let _guard = span.enter();
            commands::install::run(
                &config,
                InstallAction::All { update, depth },
                &flags,
                cli.json,
            )
        }
        Some(Commands::Add {
            specs,
            flags,
            save_dev,
            save_optional,
            save_exact,
        }) => {
            let span = tracing::info_span!("add", cmd = "add", cwd = %config.cwd.display());
            let _guard = span.enter();
            let save_type = if save_dev {
                SaveType::Dev
            } else if save_optional {
                SaveType::Optional
            } else {
                SaveType::Prod
            };
            commands::install::run(
                &config,
                InstallAction::Named {
                    specs,
                    save_type,
                    save_exact,
                },
                &flags,
                cli.json,
            )
        }
    }
}
