mod fixture;
mod report;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fixture::FixtureGateway;
use pmon_core::{InstanceId, InstanceState};
use pmon_sync::{foreground_queue, Console, ConsoleConfig, Poller, SharedFilter};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pmon")]
#[command(about = "Pipeline instance monitor", long_about = None)]
struct Cli {
    /// JSON file standing in for the pipeline service; re-read on every poll
    #[arg(long)]
    fixture: PathBuf,
    /// Poll interval in milliseconds (overrides PMON_POLL_INTERVAL_MS)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: Option<u64>,
    /// Instance to select once it shows up in the list
    #[arg(long)]
    select: Option<i64>,
    /// Exit after this many poll cycles
    #[arg(long)]
    cycles: Option<u64>,
    /// Comma-separated instance states to show (overrides PMON_FILTER_STATES)
    #[arg(long, value_delimiter = ',')]
    states: Vec<String>,
    /// Instance name substring (overrides PMON_FILTER_NAME)
    #[arg(long)]
    name: Option<String>,
    /// Only instances created within this many days (overrides PMON_FILTER_AGE_DAYS)
    #[arg(long)]
    age_days: Option<u32>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ConsoleConfig) -> Result<()> {
        if let Some(ms) = self.interval_ms {
            config.poll.interval = Duration::from_millis(ms);
        }
        if !self.states.is_empty() {
            config.filter.states = self
                .states
                .iter()
                .map(|raw| raw.parse::<InstanceState>().map_err(|err| anyhow!(err)))
                .collect::<Result<Vec<_>>>()
                .context("invalid --states")?;
        }
        if let Some(name) = &self.name {
            config.filter.name_contains = Some(name.clone());
        }
        if let Some(days) = self.age_days {
            config.filter.age_days = Some(days);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ConsoleConfig::from_env();
    cli.apply_overrides(&mut config)?;
    init_logging(config.log_stdout);

    if !cli.fixture.exists() {
        warn!(path = %cli.fixture.display(), "fixture missing; polls will fail until it appears");
    }

    let (dispatcher, mut queue) = foreground_queue::<Console>();
    let reply = dispatcher.clone();
    let gateway = FixtureGateway::new(&cli.fixture).on_queued_work(move |queued| {
        reply.invoke_later(move |console: &mut Console| console.note_queued_work(queued));
    });
    let filter: SharedFilter = Arc::new(RwLock::new(config.filter.clone()));
    let mut console = Console::new(Arc::new(gateway), filter, dispatcher, Handle::current());

    let mut poller = Poller::new(&console, config.poll);
    poller.start();
    info!(fixture = %cli.fixture.display(), "console running");

    let target = cli.select.map(InstanceId);
    let mut reported = 0;
    loop {
        tokio::select! {
            ran = queue.run_one(&mut console) => {
                if !ran {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        if let Some(id) = target {
            follow_instance(&mut console, id);
        }
        if console.cycles_applied() > reported {
            reported = console.cycles_applied();
            print!("{}", report::render(&console));
            if cli.cycles.is_some_and(|limit| reported >= limit) {
                break;
            }
        }
    }

    poller.stop();
    Ok(())
}

/// Selects `id` whenever it is listed but not selected, including after it
/// disappeared and came back.
fn follow_instance(console: &mut Console, id: InstanceId) {
    if console.selection().selected_instance().is_some() {
        return;
    }
    if console.instances().index_of(id).is_none() {
        return;
    }
    if let Err(err) = console.select_instance(id) {
        warn!(instance = %id, error = %err, "could not select instance");
    }
}

fn init_logging(log_stdout: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_stdout {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment() {
        let cli = Cli::try_parse_from([
            "pmon",
            "--fixture",
            "pipeline.json",
            "--interval-ms",
            "250",
            "--states",
            "processing,errors-stalled",
            "--name",
            "nightly",
        ])
        .expect("parse");
        let mut config = ConsoleConfig::from_lookup(|key| match key {
            "PMON_POLL_INTERVAL_MS" => Some("9000".to_string()),
            "PMON_FILTER_AGE_DAYS" => Some("3".to_string()),
            _ => None,
        });
        cli.apply_overrides(&mut config).expect("overrides");

        assert_eq!(config.poll.interval, Duration::from_millis(250));
        assert_eq!(
            config.filter.states,
            vec![InstanceState::Processing, InstanceState::ErrorsStalled]
        );
        assert_eq!(config.filter.name_contains.as_deref(), Some("nightly"));
        assert_eq!(config.filter.age_days, Some(3));
    }

    #[test]
    fn unknown_state_flag_is_rejected() {
        let cli = Cli::try_parse_from(["pmon", "--fixture", "f.json", "--states", "paused"])
            .expect("parse");
        let mut config = ConsoleConfig::default();
        assert!(cli.apply_overrides(&mut config).is_err());
    }

    #[test]
    fn zero_interval_is_refused_by_the_parser() {
        assert!(Cli::try_parse_from(["pmon", "--fixture", "f.json", "--interval-ms", "0"]).is_err());
    }
}
