//! Run serialization and scheduler integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cinecron::lock::{read_info, LockInfo, RunLock};
use cinecron::{RunOutcome, RunReport, Scheduler, Stage, Trigger};

use crate::fixtures::{config_with_task, TestRemote, TestRepo};

/// Each run appends begin/end markers around a pause; interleaved runs would
/// produce "begin begin end end".
const MARKED_TASK: &str = "echo begin >> trace.txt; sleep 0.3; echo end >> trace.txt";

/// Test: overlapping runs are serialized
/// Given two runs started at the same time against one repository
/// When both complete
/// Then their task sections never interleave and both publish in turn
#[tokio::test]
async fn test_overlapping_runs_are_serialized() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let first = work.runner(config_with_task(MARKED_TASK));
    let second = work.runner(config_with_task(MARKED_TASK));

    let (a, b) = tokio::join!(first.run(Trigger::Schedule), second.run(Trigger::Manual));

    assert!(a.is_success(), "first run failed: {:?}", a.outcome);
    assert!(b.is_success(), "second run failed: {:?}", b.outcome);
    assert_eq!(
        work.read("trace.txt").as_deref(),
        Some("begin\nend\nbegin\nend\n")
    );
    // Seed commit plus one publish commit per run.
    assert_eq!(remote.commit_count(), 3);
    assert_eq!(
        remote.files().get("trace.txt").map(String::as_str),
        Some("begin\nend\nbegin\nend\n")
    );
    assert!(RunLock::try_acquire(&first.lock_path(), Uuid::new_v4())
        .unwrap()
        .is_some());
}

/// Test: a held lock blocks the run until the wait budget runs out
#[tokio::test]
async fn test_held_lock_times_out() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("printf x > data.json");
    config.lock.wait_secs = 0;
    let runner = work.runner(config);

    let holder = Uuid::new_v4();
    let _held = RunLock::try_acquire(&runner.lock_path(), holder)
        .unwrap()
        .unwrap();

    let report = runner.run(Trigger::Schedule).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Lock,
            ..
        }
    ));
    assert!(work.read("data.json").is_none());
    // The holder's record is untouched.
    assert_eq!(read_info(&runner.lock_path()).unwrap().run_id, holder);
}

/// Test: a lock left behind by a process that died does not block the job
/// Given a lock file naming a pid that no longer exists, written just now
/// When a run starts with no wait budget
/// Then it takes the lock at once and publishes
#[tokio::test]
async fn test_lock_from_dead_process_is_recovered() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("printf x > data.json");
    config.lock.wait_secs = 0;
    let runner = work.runner(config);

    let leftover = LockInfo {
        pid: 999_999,
        run_id: Uuid::new_v4(),
        acquired_at: Utc::now(),
    };
    std::fs::write(runner.lock_path(), serde_json::to_string(&leftover).unwrap()).unwrap();

    let report = runner.run(Trigger::Schedule).await;

    assert!(report.is_success(), "run failed: {:?}", report.outcome);
    assert!(read_info(&runner.lock_path()).is_none());
    assert_eq!(remote.files().get("data.json").map(String::as_str), Some("x"));
}

/// Test: lock is released when a stage fails
#[tokio::test]
async fn test_lock_released_after_failure() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let runner = work.runner(config_with_task("exit 2"));

    let report = runner.run(Trigger::Manual).await;

    assert!(!report.is_success());
    assert!(RunLock::try_acquire(&runner.lock_path(), Uuid::new_v4())
        .unwrap()
        .is_some());
}

/// Test: an interrupted run stops its task and frees the lock
/// Given a task that would sleep for seconds
/// When the run is cancelled shortly after it starts
/// Then no report is produced, the remote is untouched and the lock is free
#[tokio::test]
async fn test_interrupted_run_releases_lock() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let before = remote.snapshot();
    let runner = work.runner(config_with_task("printf x > data.json; exec sleep 5"));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });

    let started = std::time::Instant::now();
    let report = runner.run_or_cancel(Trigger::Manual, &cancel).await;

    assert!(report.is_none());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(remote.snapshot(), before);
    assert!(RunLock::try_acquire(&runner.lock_path(), Uuid::new_v4())
        .unwrap()
        .is_some());
}

/// Test: scheduler ticks until cancelled, runs never overlap
/// Given a 100ms cadence and a task that appends a line per run
/// When the scheduler is cancelled after a while
/// Then several runs happened, each starting after the previous finished
#[tokio::test]
async fn test_scheduler_runs_on_cadence_until_cancelled() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("echo tick >> ticks.txt");
    config.schedule.run_on_start = true;
    let runner = Arc::new(work.runner(config));
    let scheduler = Scheduler::new(runner).with_interval(Duration::from_millis(100));
    assert_eq!(scheduler.interval(), Duration::from_millis(100));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        stopper.cancel();
    });

    let mut reports: Vec<RunReport> = Vec::new();
    let stats = scheduler
        .run_with(cancel, |report| reports.push(report.clone()))
        .await;

    assert!(stats.runs >= 2, "expected at least two runs, got {}", stats.runs);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.runs as usize, reports.len());
    for pair in reports.windows(2) {
        assert!(pair[0].finished_at <= pair[1].started_at);
    }
    assert!(reports.iter().all(|r| r.trigger == Trigger::Schedule));

    let ticks = remote.files().get("ticks.txt").cloned().unwrap_or_default();
    assert_eq!(ticks.lines().count(), reports.len());
}

/// Test: failed runs do not stop the scheduler
#[tokio::test]
async fn test_scheduler_survives_failed_runs() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let runner = Arc::new(work.runner(config_with_task("exit 1")));
    let scheduler = Scheduler::new(runner).with_interval(Duration::from_millis(50));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let stats = scheduler.run(cancel).await;

    assert!(stats.runs >= 2);
    assert_eq!(stats.failures, stats.runs);
}

/// Test: run_on_start = false waits a full interval before the first run
#[tokio::test]
async fn test_scheduler_without_run_on_start_waits() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("true");
    config.schedule.run_on_start = false;
    let runner = Arc::new(work.runner(config));
    let scheduler = Scheduler::new(runner).with_interval(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    let stats = scheduler.run(cancel).await;
    assert_eq!(stats.runs, 0);
}
