//! cinecron: a scheduled fetch, notify and commit job.
//!
//! Each run takes the repository's run lock, prepares the environment, runs
//! the external fetch-and-notify task, and publishes any resulting changes
//! by committing, rebasing onto the remote and pushing. The repository's
//! branch is the durable store.

pub mod config;
pub mod error;
pub mod git;
pub mod lock;
pub mod log;
pub mod prepare;
pub mod runner;
pub mod schedule;
pub mod secrets;
pub mod task;
pub mod util;

pub use error::{Error, Result, Stage};
pub use runner::{RunOutcome, RunReport, Runner};
pub use schedule::{Scheduler, Trigger};
