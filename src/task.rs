//! The fetch-and-notify task boundary.
//!
//! The task is an external command. Its contract is what it receives (secret
//! environment, committer identity, the working directory) and its exit
//! status. What it fetches and what it sends are its own business.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::TaskConfig;
use crate::git::Identity;
use crate::secrets::Secrets;
use crate::util::within;
use crate::{clog, clog_warn, Error, Result};

/// Result of a successful task run.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub elapsed: Duration,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// Environment the task is started with, on top of the inherited one.
pub fn task_env(secrets: &Secrets, identity: &Identity) -> Vec<(String, String)> {
    let mut env = secrets.task_env();
    for (key, value) in [
        ("GIT_AUTHOR_NAME", &identity.name),
        ("GIT_AUTHOR_EMAIL", &identity.email),
        ("GIT_COMMITTER_NAME", &identity.name),
        ("GIT_COMMITTER_EMAIL", &identity.email),
    ] {
        env.push((key.to_string(), value.clone()));
    }
    env
}

/// Run the task to completion. Any non-success status is an error.
pub async fn run(
    config: &TaskConfig,
    secrets: &Secrets,
    identity: &Identity,
    workdir: &Path,
) -> Result<TaskRun> {
    let Some((program, args)) = config.command.split_first() else {
        return Err(Error::Validation("task.command cannot be empty".to_string()));
    };
    clog!("task: running {:?} in {}", config.command, workdir.display());

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .env_remove(secrets.push_token_var())
        .envs(task_env(secrets, identity))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| Error::TaskFailed {
        status: format!("could not start '{}': {}", program, e),
    })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(Error::TaskFailed {
            status: "task output pipes unavailable".to_string(),
        });
    };

    let drive = async move {
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);
        let (mut stdout_lines, mut stderr_lines) = (0usize, 0usize);

        // Drain both pipes concurrently so a chatty task never blocks on a full pipe.
        while !out_done || !err_done {
            tokio::select! {
                line = out.next_line(), if !out_done => match line? {
                    Some(line) => {
                        stdout_lines += 1;
                        clog!("task: {}", line);
                    }
                    None => out_done = true,
                },
                line = err.next_line(), if !err_done => match line? {
                    Some(line) => {
                        stderr_lines += 1;
                        clog_warn!("task: {}", line);
                    }
                    None => err_done = true,
                },
            }
        }

        let status = child.wait().await?;
        Ok::<_, Error>((status, stdout_lines, stderr_lines))
    };

    let (status, stdout_lines, stderr_lines) = within(config.timeout(), drive).await?;
    let elapsed = started.elapsed();

    if !status.success() {
        return Err(Error::TaskFailed {
            status: status.to_string(),
        });
    }

    clog!("task: finished in {:.2}s", elapsed.as_secs_f64());
    Ok(TaskRun {
        elapsed,
        stdout_lines,
        stderr_lines,
    })
}
