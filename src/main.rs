use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cinecron::config::Config;
use cinecron::secrets::{EnvSource, Secrets};
use cinecron::{clog, clog_warn, Result, Runner, Scheduler, Trigger};

/// cinecron - scheduled fetch, notify and commit job
#[derive(Parser, Debug)]
#[command(name = "cinecron")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CINECRON_DEBUG=1     Enable debug logging (alternative to --debug)\n    TELEGRAM_BOT_TOKEN   Messaging-bot credential passed to the task\n    TELEGRAM_USER_ID     Recipient identifier passed to the task\n    GITHUB_TOKEN         Push credential used by the publish stage")]
pub struct Cli {
    /// Repository holding the fetched state (defaults to the current directory)
    #[arg(short = 'C', long, default_value = ".")]
    pub repo: PathBuf,

    /// Config file (defaults to <repo>/cinecron.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Perform a single run (manual dispatch)
    Run {
        /// Tag the run with the trigger that caused it
        #[arg(long, value_enum, default_value_t = Trigger::Manual)]
        trigger: Trigger,

        /// Print the run report as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Run on a fixed cadence until interrupted
    Schedule {
        /// Override schedule.interval_secs
        #[arg(long)]
        every: Option<u64>,
    },

    /// Validate config and secrets and prepare the environment, without running the task
    Check,
}

fn build_runner(cli: &Cli) -> Result<Runner> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Config::default_path(&cli.repo));
    let config = Config::load(&config_path)?;
    if let Some(file) = config.log.file_path() {
        cinecron::log::set_file(&file);
    }
    let secrets = Secrets::load(&config.secrets, &EnvSource);
    Runner::new(config, &cli.repo, secrets)
}

/// Token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            clog_warn!("Interrupt received; stopping");
            on_signal.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cinecron::log::init_with_debug(cli.debug);

    let runner = build_runner(&cli)?;

    match cli.command {
        Command::Run { trigger, json } => {
            let cancel = interrupt_token();
            let Some(report) = runner.run_or_cancel(trigger, &cancel).await else {
                return Err(cinecron::Error::Interrupted);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            report.ensure_success()
        }
        Command::Schedule { every } => {
            let runner = Arc::new(runner);
            let mut scheduler = Scheduler::new(runner);
            if let Some(secs) = every {
                if secs == 0 {
                    return Err(cinecron::Error::Validation(
                        "--every must be greater than zero".to_string(),
                    ));
                }
                scheduler = scheduler.with_interval(Duration::from_secs(secs));
            }

            let cancel = interrupt_token();
            scheduler.run(cancel).await;
            Ok(())
        }
        Command::Check => {
            let prepared = runner.check().await?;
            clog!(
                "check: ok (runtime={:?} version={:?} installed={:?})",
                prepared.runtime,
                prepared.runtime_version,
                prepared.installed
            );
            Ok(())
        }
    }
}
