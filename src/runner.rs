//! One run: lock, prepare, task, publish.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::Repository;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Stage;
use crate::git::{Identity, PublishOutcome, Publisher};
use crate::lock::RunLock;
use crate::prepare::{self, Prepared};
use crate::schedule::Trigger;
use crate::secrets::Secrets;
use crate::util::blocking;
use crate::{clog, clog_debug, clog_error, clog_warn, task, Error, Result};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Published {
        committed: Option<String>,
        pushed: Option<String>,
        rebased: bool,
    },
    NoChanges,
    Failed { stage: Stage, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }

    /// Turn a failed report into an error so the process exits non-zero.
    pub fn ensure_success(&self) -> Result<()> {
        match &self.outcome {
            RunOutcome::Failed { stage, error } => Err(Error::RunFailed {
                stage: *stage,
                message: error.clone(),
            }),
            _ => Ok(()),
        }
    }
}

impl From<PublishOutcome> for RunOutcome {
    fn from(outcome: PublishOutcome) -> Self {
        if outcome.is_noop() {
            RunOutcome::NoChanges
        } else {
            RunOutcome::Published {
                committed: outcome.committed,
                pushed: outcome.pushed,
                rebased: outcome.rebased,
            }
        }
    }
}

/// Drives runs against one repository.
pub struct Runner {
    config: Config,
    workdir: PathBuf,
    git_dir: PathBuf,
    secrets: Secrets,
}

impl Runner {
    pub fn new(config: Config, repo_path: &Path, secrets: Secrets) -> Result<Self> {
        config.validate()?;
        let repo = Repository::discover(repo_path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Validation("repository has no working directory".to_string()))?
            .to_path_buf();
        Ok(Self {
            config,
            workdir,
            git_dir: repo.path().to_path_buf(),
            secrets,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn lock_path(&self) -> PathBuf {
        RunLock::path_for(&self.git_dir)
    }

    /// Environment preparation only, without taking the lock.
    pub async fn check(&self) -> Result<Prepared> {
        prepare::prepare(&self.config.prepare, &self.secrets, &self.workdir).await
    }

    /// Perform one run. Failures are reported in the returned outcome.
    pub async fn run(&self, trigger: Trigger) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        clog!("run {} started (trigger={})", run_id, trigger);

        let outcome = match self.execute(run_id).await {
            Ok(published) => RunOutcome::from(published),
            Err((stage, e)) => {
                clog_error!("run {} failed during {}: {}", run_id, stage, e);
                RunOutcome::Failed {
                    stage,
                    error: e.to_string(),
                }
            }
        };

        let report = RunReport {
            run_id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            outcome,
        };
        clog!("run {} finished: {:?}", run_id, report.outcome);
        report
    }

    /// Like [`Runner::run`], but gives up when `cancel` fires. Returns `None`
    /// when interrupted; the task child is killed and the lock released.
    /// A publish already in progress finishes before the lock is released.
    pub async fn run_or_cancel(
        &self,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Option<RunReport> {
        tokio::select! {
            report = self.run(trigger) => Some(report),
            _ = cancel.cancelled() => {
                clog_warn!("run interrupted (trigger={})", trigger);
                None
            }
        }
    }

    async fn execute(&self, run_id: Uuid) -> std::result::Result<PublishOutcome, (Stage, Error)> {
        let at = |stage: Stage| move |e: Error| (e.stage().unwrap_or(stage), e);

        // Released on drop, on every path.
        let lock = RunLock::acquire(&self.lock_path(), run_id, &self.config.lock)
            .await
            .map_err(at(Stage::Lock))?;

        prepare::prepare(&self.config.prepare, &self.secrets, &self.workdir)
            .await
            .map_err(at(Stage::Prepare))?;

        let identity = Identity::from_config(&self.config.publish);
        let finished = task::run(&self.config.task, &self.secrets, &identity, &self.workdir)
            .await
            .map_err(at(Stage::Task))?;
        clog_debug!(
            "run {}: task took {:.2}s ({} stdout lines, {} stderr lines)",
            run_id,
            finished.elapsed.as_secs_f64(),
            finished.stdout_lines,
            finished.stderr_lines
        );

        // The task succeeded; only now may anything reach the durable store.
        // The lock travels with the publish so it outlives a cancelled caller.
        let workdir = self.workdir.clone();
        let publish = self.config.publish.clone();
        let token = self.secrets.push_token().map(str::to_string);
        blocking(move || {
            let _lock = lock;
            Publisher::new(&workdir, &publish, token.as_deref())?.publish()
        })
        .await
        .map_err(at(Stage::Publish))
    }
}
