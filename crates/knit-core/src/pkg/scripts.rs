//! Lifecycle scripts.

use super::error::PkgError;
use super::manifest::Manifest;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Stages run for a package after it is materialized.
pub const PACKAGE_INSTALL_STAGES: [&str; 3] = ["preinstall", "install", "postinstall"];

/// Stages run for the project after linking.
pub const ROOT_POST_INSTALL_STAGES: [&str; 3] = ["install", "postinstall", "prepare"];

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Directory the script runs in.
    pub cwd: PathBuf,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
}

/// Runs one lifecycle script of a package.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `stage` from `manifest.scripts`. A missing script is a no-op.
    async fn run(
        &self,
        stage: &str,
        manifest: &Manifest,
        opts: &ScriptOptions,
    ) -> Result<(), PkgError>;
}

/// Runs scripts through the platform shell with `node_modules/.bin` on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct CommandScriptRunner {
    /// Also put this directory's `node_modules/.bin` on `PATH`.
    pub root: Option<PathBuf>,
    /// Let the child write to the terminal instead of capturing its output.
    pub inherit_stdio: bool,
}

impl CommandScriptRunner {
    fn search_path(&self, cwd: &Path) -> Option<OsString> {
        let mut dirs = vec![cwd.join("node_modules").join(".bin")];
        if let Some(root) = &self.root {
            dirs.push(root.join("node_modules").join(".bin"));
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        std::env::join_paths(dirs).ok()
    }
}

#[async_trait]
impl ScriptRunner for CommandScriptRunner {
    async fn run(
        &self,
        stage: &str,
        manifest: &Manifest,
        opts: &ScriptOptions,
    ) -> Result<(), PkgError> {
        let Some(script) = manifest.scripts.get(stage) else {
            return Ok(());
        };
        tracing::debug!(package = %manifest.name, stage, script = %script, "running lifecycle script");

        let mut cmd = shell(script);
        cmd.current_dir(&opts.cwd)
            .env("npm_lifecycle_event", stage)
            .env("npm_package_name", &manifest.name)
            .env("npm_package_version", &manifest.version)
            .envs(&opts.env)
            .stdin(Stdio::null());
        if let Some(path) = self.search_path(&opts.cwd) {
            cmd.env("PATH", path);
        }
        if self.inherit_stdio {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let output = cmd.output().await.map_err(|e| {
            PkgError::script_failed(format!("{}: failed to start `{stage}`: {e}", manifest.name))
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PkgError::script_failed(format!(
            "{}@{} `{stage}` exited with {}: {}",
            manifest.name,
            manifest.version,
            output
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
            stderr.trim()
        )))
    }
}

#[cfg(unix)]
fn shell(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[cfg(not(unix))]
fn shell(script: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/d").arg("/s").arg("/c").arg(script);
    cmd
}

/// Run the install stages of the package in `pkg_dir`.
///
/// # Errors
/// Returns the first failing stage's error.
pub async fn run_install_scripts(
    runner: &dyn ScriptRunner,
    pkg_dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(), PkgError> {
    let Some(manifest) = Manifest::read_from_dir(pkg_dir)? else {
        return Ok(());
    };
    if manifest.scripts.is_empty() {
        return Ok(());
    }
    let opts = ScriptOptions {
        cwd: pkg_dir.to_path_buf(),
        env: env.clone(),
    };
    for stage in PACKAGE_INSTALL_STAGES {
        runner.run(stage, &manifest, &opts).await?;
    }
    Ok(())
}
