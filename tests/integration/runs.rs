//! Single-run integration tests.
//!
//! These follow one run through lock, preparation, task and publish, and
//! check that a failure in any stage leaves the remote untouched.

use cinecron::secrets::{MapSource, Secrets};
use cinecron::{RunOutcome, Runner, Stage, Trigger};

use crate::fixtures::{config_with_task, tree_files, TestRemote, TestRepo};

/// Test: first fetch result is committed and pushed
/// Given a task that writes data.json = {"id":1} where none existed
/// When a run completes
/// Then one commit authored by "Abhishek Verma" carries exactly that file
#[tokio::test]
async fn test_new_file_is_committed_and_pushed() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let runner = work.runner(config_with_task("printf '{\"id\":1}' > data.json"));

    let report = runner.run(Trigger::Manual).await;

    match &report.outcome {
        RunOutcome::Published {
            committed, pushed, ..
        } => {
            assert!(committed.is_some(), "expected a publish commit");
            assert_eq!(committed, pushed);
        }
        other => panic!("expected Published, got {:?}", other),
    }
    assert_eq!(report.trigger, Trigger::Manual);
    assert_eq!(remote.head_author().as_deref(), Some("Abhishek Verma"));
    assert_eq!(remote.files().get("data.json").map(String::as_str), Some("{\"id\":1}"));
    assert_eq!(remote.commit_count(), 2);
}

/// Test: commit tree equals the post-task working directory
/// Given a task that adds, modifies and deletes files
/// When a run completes
/// Then the pushed tree matches the working directory exactly
#[tokio::test]
async fn test_commit_matches_working_directory() {
    let remote = TestRemote::seeded();
    remote.commit_file("stale.json", "{}", "Add stale file");
    let work = TestRepo::clone_of(&remote);
    let runner = work.runner(config_with_task(
        "rm stale.json && mkdir -p movies && echo one > movies/tt0000001.json && echo two > README.md",
    ));

    let report = runner.run(Trigger::Schedule).await;
    assert!(report.is_success(), "run failed: {:?}", report.outcome);

    let repo = remote.repo();
    let pushed = tree_files(&repo, remote.head().unwrap());
    assert_eq!(pushed, work.workdir_files());
    assert!(!pushed.contains_key("stale.json"));
    assert_eq!(pushed.get("movies/tt0000001.json").map(String::as_str), Some("one\n"));
}

/// Test: identical rewrite is a no-op
/// Given data.json already published
/// When the task writes the same content again
/// Then no commit is created and nothing is pushed
#[tokio::test]
async fn test_identical_content_creates_no_commit() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let runner = work.runner(config_with_task("printf '{\"id\":1}' > data.json"));

    assert!(runner.run(Trigger::Schedule).await.is_success());
    let remote_before = remote.snapshot();
    let local_before = work.head();

    let report = runner.run(Trigger::Schedule).await;

    assert_eq!(report.outcome, RunOutcome::NoChanges);
    assert_eq!(remote.snapshot(), remote_before);
    assert_eq!(work.head(), local_before);
}

/// Test: task that changes nothing
/// Given a task that only prints
/// When a run completes
/// Then the outcome is NoChanges and the remote is untouched
#[tokio::test]
async fn test_no_changes_is_successful_noop() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let before = remote.snapshot();
    let runner = work.runner(config_with_task("echo nothing new"));

    let report = runner.run(Trigger::Manual).await;

    assert_eq!(report.outcome, RunOutcome::NoChanges);
    assert!(report.ensure_success().is_ok());
    assert_eq!(remote.snapshot(), before);
}

/// Test: preparation failure aborts before the task
/// Given a dependency install that fails
/// When a run starts
/// Then the task never runs, nothing is committed, the remote is unchanged
#[tokio::test]
async fn test_prepare_failure_leaves_everything_untouched() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let before = remote.snapshot();
    let local_before = work.head();

    let mut config = config_with_task("printf changed > data.json");
    config.prepare.install = vec!["sh".into(), "-c".into(), "exit 1".into()];
    config.prepare.dependencies = vec!["requests".into()];
    let runner = work.runner(config);

    let report = runner.run(Trigger::Schedule).await;

    match &report.outcome {
        RunOutcome::Failed { stage, .. } => assert_eq!(*stage, Stage::Prepare),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(report.ensure_success().is_err());
    assert!(work.read("data.json").is_none());
    assert_eq!(work.head(), local_before);
    assert_eq!(remote.snapshot(), before);
}

/// Test: missing runtime is an environment failure
#[tokio::test]
async fn test_missing_runtime_is_prepare_failure() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("printf x > data.json");
    config.prepare.runtime = Some("no-such-runtime-for-cinecron".into());
    let runner = work.runner(config);

    let report = runner.run(Trigger::Manual).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Prepare,
            ..
        }
    ));
    assert!(work.read("data.json").is_none());
}

/// Test: task failure is checked before publish
/// Given a task that writes a file and then exits non-zero
/// When a run completes
/// Then nothing is committed or pushed
#[tokio::test]
async fn test_task_failure_skips_publish() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let before = remote.snapshot();
    let local_before = work.head();
    let runner = work.runner(config_with_task("printf partial > data.json; exit 1"));

    let report = runner.run(Trigger::Schedule).await;

    match &report.outcome {
        RunOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Task);
            assert!(error.contains("Task exited unsuccessfully"), "error: {}", error);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(work.head(), local_before);
    assert_eq!(remote.snapshot(), before);
    // The partial write stays on disk for the next run to overwrite.
    assert_eq!(work.read("data.json").as_deref(), Some("partial"));
}

/// Test: missing task secret fails preparation
#[tokio::test]
async fn test_missing_secret_is_prepare_failure() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let mut config = config_with_task("printf x > data.json");
    // Read the recipient from a variable the test secrets do not define.
    config.secrets.recipient_var = "CINECRON_TEST_UNSET_RECIPIENT".into();
    let source = MapSource::new().with(&config.secrets.bot_token_var, "123456:test-bot-token");
    let secrets = Secrets::load(&config.secrets, &source);
    let runner = Runner::new(config, &work.path, secrets).unwrap();

    let report = runner.run(Trigger::Manual).await;

    match &report.outcome {
        RunOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Prepare);
            assert!(error.contains("CINECRON_TEST_UNSET_RECIPIENT"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

/// Test: the task receives the messaging secrets
#[tokio::test]
async fn test_task_receives_secrets() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let runner = work.runner(config_with_task(
        "printf '%s %s' \"$TELEGRAM_BOT_TOKEN\" \"$TELEGRAM_USER_ID\" > seen.txt",
    ));

    assert!(runner.run(Trigger::Manual).await.is_success());
    assert_eq!(
        remote.files().get("seen.txt").map(String::as_str),
        Some("123456:test-bot-token 424242")
    );
}

/// Test: first run against an empty store creates the branch
#[tokio::test]
async fn test_first_run_creates_remote_branch() {
    let remote = TestRemote::empty();
    let work = TestRepo::init_with_origin(&remote);
    let runner = work.runner(config_with_task("printf '{\"id\":1}' > data.json"));

    let report = runner.run(Trigger::Manual).await;

    assert!(report.is_success(), "run failed: {:?}", report.outcome);
    assert_eq!(remote.commit_count(), 1);
    let files = remote.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files.get("data.json").map(String::as_str), Some("{\"id\":1}"));
}

/// Test: build output next to the state is never published
/// Given the repository carries the crate's .gitignore
/// When a build left target/ and Cargo.lock in the working tree
/// Then only the task's data reaches the remote
#[tokio::test]
async fn test_build_output_is_not_published() {
    let remote = TestRemote::seeded();
    remote.commit_file(
        ".gitignore",
        include_str!("../../.gitignore"),
        "Ignore build output",
    );
    let work = TestRepo::clone_of(&remote);
    std::fs::create_dir_all(work.path.join("target/release")).unwrap();
    std::fs::write(work.path.join("target/release/cinecron"), "binary").unwrap();
    std::fs::write(work.path.join("Cargo.lock"), "# lock").unwrap();
    let runner = work.runner(config_with_task("printf '{\"id\":1}' > data.json"));

    let report = runner.run(Trigger::Schedule).await;

    assert!(report.is_success(), "run failed: {:?}", report.outcome);
    let files = remote.files();
    assert_eq!(files.get("data.json").map(String::as_str), Some("{\"id\":1}"));
    assert!(files.keys().all(|name| !name.starts_with("target/")), "{:?}", files.keys());
    assert!(!files.contains_key("Cargo.lock"));
}

/// Test: a push credential never lands in the repository config
/// Given a push token is configured
/// When a run publishes
/// Then origin's URL and .git/config are unchanged and hold no token
#[tokio::test]
async fn test_push_token_not_persisted() {
    let remote = TestRemote::seeded();
    let work = TestRepo::clone_of(&remote);
    let config = config_with_task("printf '{\"id\":5}' > data.json");
    let source = MapSource::new()
        .with(&config.secrets.bot_token_var, "123456:test-bot-token")
        .with(&config.secrets.recipient_var, "424242")
        .with(&config.secrets.push_token_var, "ghs_pushsecret");
    let secrets = Secrets::load(&config.secrets, &source);
    let runner = Runner::new(config, &work.path, secrets).unwrap();
    let config_before = std::fs::read_to_string(work.path.join(".git/config")).unwrap();

    let report = runner.run(Trigger::Manual).await;

    assert!(report.is_success(), "run failed: {:?}", report.outcome);
    assert_eq!(remote.files().get("data.json").map(String::as_str), Some("{\"id\":5}"));
    let repo = work.repo();
    let origin = repo.find_remote("origin").unwrap();
    assert_eq!(origin.url(), Some(remote.url().as_str()));
    let config_after = std::fs::read_to_string(work.path.join(".git/config")).unwrap();
    assert!(!config_after.contains("ghs_pushsecret"));
    assert_eq!(config_after, config_before);
}
