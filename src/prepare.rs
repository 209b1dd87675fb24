//! Environment preparation: runtime check and dependency install.
//!
//! Everything here runs before the task, so any failure leaves the
//! repository untouched.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

use crate::config::PrepareConfig;
use crate::secrets::Secrets;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// What preparation found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub runtime: Option<PathBuf>,
    pub runtime_version: Option<String>,
    pub installed: Vec<String>,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)+").expect("static regex"))
}

/// First dotted version number in a `--version` banner.
pub fn extract_version(banner: &str) -> Option<&str> {
    version_regex().find(banner).map(|m| m.as_str())
}

/// Whether `version` falls under `prefix`, compared component-wise:
/// `3.1` matches `3.1.4` but not `3.10.0`.
pub fn version_matches(version: &str, prefix: &str) -> bool {
    let prefix = prefix.trim().trim_start_matches('v');
    if prefix.is_empty() {
        return true;
    }
    let mut have = version.split('.');
    prefix
        .split('.')
        .all(|want| want == "x" || want == "*" || have.next() == Some(want))
}

async fn check_runtime(program: &str, wanted: Option<&str>) -> Result<(PathBuf, Option<String>)> {
    let path = which::which(program)
        .map_err(|e| Error::Prepare(format!("runtime '{}' not found on PATH: {}", program, e)))?;
    clog_debug!("prepare: runtime {} resolved to {}", program, path.display());

    let Some(wanted) = wanted else {
        return Ok((path, None));
    };

    let output = Command::new(&path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| Error::Prepare(format!("failed to run '{} --version': {}", program, e)))?;
    // Some runtimes print the banner to stderr.
    let banner = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let found = extract_version(&banner).ok_or_else(|| {
        Error::Prepare(format!(
            "could not read a version from '{} --version': {}",
            program,
            banner.trim()
        ))
    })?;
    if !version_matches(found, wanted) {
        return Err(Error::Prepare(format!(
            "runtime '{}' is version {}, expected {}",
            program, found, wanted
        )));
    }
    Ok((path, Some(found.to_string())))
}

async fn install(config: &PrepareConfig, workdir: &Path) -> Result<()> {
    let Some((program, args)) = config.install.split_first() else {
        return Err(Error::Prepare("prepare.install is empty".to_string()));
    };
    clog!(
        "prepare: installing {} dependencies with {}",
        config.dependencies.len(),
        program
    );
    let output = Command::new(program)
        .args(args)
        .args(&config.dependencies)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| Error::Prepare(format!("failed to start installer '{}': {}", program, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        clog_warn!("prepare: installer failed: {}", stderr.trim());
        return Err(Error::Prepare(format!(
            "dependency install failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Run the preparation stage.
pub async fn prepare(config: &PrepareConfig, secrets: &Secrets, workdir: &Path) -> Result<Prepared> {
    secrets.ensure_task_secrets()?;

    let mut prepared = Prepared::default();
    if let Some(runtime) = config.runtime.as_deref() {
        let (path, version) = check_runtime(runtime, config.runtime_version.as_deref()).await?;
        prepared.runtime = Some(path);
        prepared.runtime_version = version;
    }

    if !config.dependencies.is_empty() {
        install(config, workdir).await?;
        prepared.installed = config.dependencies.clone();
    }

    clog_debug!("prepare: done {:?}", prepared);
    Ok(prepared)
}
