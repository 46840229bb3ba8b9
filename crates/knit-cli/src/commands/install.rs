//! `knit install` and `knit add` command implementation.

use knit_core::config::{normalize_registry, Channel};
use knit_core::pkg::{
    install, install_named, CommandScriptRunner, FetchGate, InstallOutcome, RegistryClient,
    SaveOptions, SaveType, StoreFetchGate,
};
use knit_core::{paths, Config, Error, InstallOptions};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Flags shared by `install` and `add`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct InstallFlags {
    /// Skip devDependencies
    #[arg(long, alias = "prod")]
    pub production: bool,

    /// Skip optionalDependencies
    #[arg(long)]
    pub no_optional: bool,

    /// Relink every package and ignore platform checks
    #[arg(long)]
    pub force: bool,

    /// Do not run lifecycle scripts
    #[arg(long)]
    pub ignore_scripts: bool,

    /// Registry URL
    #[arg(long, value_name = "URL")]
    pub registry: Option<String>,

    /// Content store directory
    #[arg(long, value_name = "PATH")]
    pub store_dir: Option<PathBuf>,

    /// Leave leaf packages in the store instead of hardlinking them
    #[arg(long)]
    pub independent_leaves: bool,

    /// Fail when a required package does not support this Node version
    #[arg(long)]
    pub engine_strict: bool,
}

#[derive(Debug, Clone)]
pub enum InstallAction {
    All { update: bool, depth: i64 },
    Named {
        specs: Vec<String>,
        save_type: SaveType,
        save_exact: bool,
    },
}

/// Result for JSON output (locked format: { ok, install } or { ok, error }).
#[derive(Serialize)]
struct InstallJsonResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<InstallSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct InstallSummary {
    added: Vec<AddedPackage>,
    removed: Vec<String>,
    materialized: usize,
    skipped: Vec<String>,
}

#[derive(Serialize)]
struct AddedPackage {
    name: String,
    version: String,
    id: String,
    dev: bool,
    optional: bool,
}

impl From<&InstallOutcome> for InstallSummary {
    fn from(outcome: &InstallOutcome) -> Self {
        Self {
            added: outcome
                .roots
                .iter()
                .map(|root| AddedPackage {
                    name: root.name.clone(),
                    version: root.version.clone(),
                    id: root.pkg_id.clone(),
                    dev: root.dev,
                    optional: root.optional,
                })
                .collect(),
            removed: outcome.removed.clone(),
            materialized: outcome.materialized_paths.len(),
            skipped: outcome.skipped.iter().cloned().collect(),
        }
    }
}

/// Run `install` or `add`.
pub fn run(config: &Config, action: InstallAction, flags: &InstallFlags, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    match runtime.block_on(execute(config, action, flags, json)) {
        Ok(outcome) => {
            print_outcome(&outcome, json);
            Ok(())
        }
        Err(err) => {
            let (code, message) = error_parts(&err);
            if json {
                let result = InstallJsonResult {
                    ok: false,
                    install: None,
                    error: Some(ErrorInfo { code, message }),
                };
                println!("{}", to_json(&result));
                std::process::exit(1);
            }
            Err(miette::miette!(code = code, "{message}"))
        }
    }
}

async fn execute(
    config: &Config,
    action: InstallAction,
    flags: &InstallFlags,
    json: bool,
) -> Result<InstallOutcome, Error> {
    let root = paths::project_root(&config.cwd).ok_or_else(|| Error::ProjectNotFound {
        start: config.cwd.clone(),
    })?;
    let opts = build_options(&root, config.channel, flags, &action)?;

    let client = RegistryClient::new(opts.network_concurrency)?;
    let gate: Arc<dyn FetchGate> = Arc::new(StoreFetchGate::new(
        client,
        opts.store_dir.clone(),
        root.clone(),
    ));
    let runner = CommandScriptRunner {
        root: Some(root.clone()),
        inherit_stdio: !json,
    };

    match action {
        InstallAction::All { .. } => install(&root, &opts, gate, &runner).await,
        InstallAction::Named {
            specs, save_type, ..
        } => install_named(&root, &specs, SaveOptions { save_type }, &opts, gate, &runner).await,
    }
}

/// Defaults, `.npmrc` and environment, then command-line flags.
fn build_options(
    root: &std::path::Path,
    channel: Channel,
    flags: &InstallFlags,
    action: &InstallAction,
) -> Result<InstallOptions, Error> {
    let mut opts = InstallOptions::load(root, channel)?;
    if let Some(registry) = &flags.registry {
        opts.registry = normalize_registry(registry)?;
    }
    if let Some(store_dir) = &flags.store_dir {
        opts.store_dir.clone_from(store_dir);
    }
    opts.production = flags.production;
    opts.optional = !flags.no_optional;
    opts.force = flags.force;
    opts.ignore_scripts = flags.ignore_scripts;
    opts.independent_leaves = flags.independent_leaves;
    opts.engine_strict = flags.engine_strict;
    match action {
        InstallAction::All { update, depth } => {
            opts.update = *update;
            opts.depth = *depth;
        }
        InstallAction::Named { save_exact, .. } => opts.save_exact = *save_exact,
    }
    Ok(opts)
}

fn error_parts(err: &Error) -> (&'static str, String) {
    match err {
        Error::Pkg(e) => (e.code(), e.message().to_string()),
        Error::Lockfile(e) => (e.code(), e.message().to_string()),
        other => (other.code(), other.to_string()),
    }
}

fn print_outcome(outcome: &InstallOutcome, json: bool) {
    if json {
        let result = InstallJsonResult {
            ok: true,
            install: Some(InstallSummary::from(outcome)),
            error: None,
        };
        println!("{}", to_json(&result));
        return;
    }

    for root in &outcome.roots {
        let section = if root.dev {
            " (dev)"
        } else if root.optional {
            " (optional)"
        } else {
            ""
        };
        println!("+ {} {}{section}", root.name, root.version);
    }
    for removed in &outcome.removed {
        println!("- {removed}");
    }
    println!(
        "Packages: +{} -{}",
        outcome.materialized_paths.len(),
        outcome.removed.len()
    );
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{\"ok\":false}".to_string())
}
