//! Command-line interface for the Tally rule engine.

mod config;
mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use tally_core::config::{env_flag, env_vars, paths};
use tally_core::{EventBus, InstanceKey, Subscription};
use tally_messages::{ConsoleWriter, WriterRegistry};
use tally_rules::{RuleRegistry, StaticMetadata};
use tally_storage::{BackendCounterStore, StorageBackend};

use crate::config::TallyConfig;

/// Tally - cycle accumulation rule engine.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true, env = env_vars::CONFIG)]
    config: Option<PathBuf>,

    /// Directory of the counter database.
    #[arg(long, global = true, env = env_vars::DATA_DIR)]
    data_dir: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine on newline-delimited JSON events from stdin.
    Run {
        /// Print the engine's mirror writes to stdout.
        #[arg(long)]
        print_mirror: bool,
    },
    /// Show persisted counters.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and exit.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let data_dir = args.data_dir.as_deref();

    match args.command {
        Command::Run { print_mirror } => run_engine(config, data_dir, print_mirror).await,
        Command::Status { json } => show_status(&config, data_dir, json),
        Command::Validate => validate(&config),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = env_flag(env_vars::LOG_JSON);

    let default_directive = if verbose { "tally=debug" } else { "tally=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // stdout carries command output
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Load the explicit config file, else `tally.toml` when present, else defaults.
fn load_config(path: Option<&Path>) -> Result<TallyConfig> {
    if let Some(path) = path {
        return TallyConfig::load(path);
    }
    let default = Path::new(paths::DEFAULT_CONFIG_FILE);
    if default.exists() {
        return TallyConfig::load(default);
    }
    tracing::info!("No config file found, running with defaults");
    Ok(TallyConfig::default())
}

fn open_backend(config: &TallyConfig, data_dir: Option<&Path>) -> Result<Arc<dyn StorageBackend>> {
    let storage = config.storage_config(data_dir);
    tally_storage::open_backend(&storage)
        .with_context(|| format!("Failed to open {} storage", storage.backend))
}

async fn build_writers(config: &TallyConfig) -> WriterRegistry {
    let writers = WriterRegistry::with_fallback(Arc::new(ConsoleWriter::new("console"))).await;
    for preset in &config.presets {
        let writer = ConsoleWriter::new(preset.preset_id.clone()).with_preset(preset.clone());
        writers.register(preset.preset_id.clone(), Arc::new(writer)).await;
    }
    writers
}

async fn run_engine(config: TallyConfig, data_dir: Option<&Path>, print_mirror: bool) -> Result<()> {
    config.validate()?;

    let bus = EventBus::with_name("tally");
    let backend = open_backend(&config, data_dir)?;
    let store = Arc::new(BackendCounterStore::new(backend).with_event_bus(bus.clone()));
    let writers = Arc::new(build_writers(&config).await);
    let metadata = Arc::new(StaticMetadata::from(config.signals.clone()));
    let registry = Arc::new(
        RuleRegistry::new(
            store,
            writers,
            Arc::new(ConsoleWriter::new("console")),
            metadata,
        )
        .with_dispose_timeout(config.engine.dispose_timeout()),
    );

    for rule in &config.rules {
        registry
            .add_rule(rule.clone())
            .await
            .with_context(|| format!("Failed to add rule {}", rule.key()))?;
    }
    tracing::info!(rules = registry.len().await, "Engine started");

    let printer = print_mirror.then(|| spawn_printer(bus.state_events()));
    let dispatcher = tokio::spawn(registry.clone().run(bus.subscribe()));
    let ticker = config
        .engine
        .tick_interval()
        .map(|interval| spawn_ticker(registry.clone(), interval));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut line_no = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                line_no += 1;
                match transport::parse_line(&line) {
                    Ok(Some(event)) => registry.handle_event(&event).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(line = line_no, error = %e, "Skipping invalid input line"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    registry.flush().await;
    for snapshot in registry.snapshots().await {
        let sub_counter = snapshot.state.as_ref().map(|s| s.sub_counter).unwrap_or(0.0);
        tracing::info!(rule = %snapshot.key, phase = ?snapshot.phase, sub_counter, "Final state");
    }

    if let Some(ticker) = ticker {
        ticker.abort();
        let _ = ticker.await;
    }
    registry.shutdown().await;
    dispatcher.abort();
    let _ = dispatcher.await;

    // Closing the bus lets the printer drain and exit
    drop(registry);
    drop(bus);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(())
}

fn spawn_ticker(registry: Arc<RuleRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            let ticked = registry.tick(Utc::now()).await;
            tracing::trace!(ticked, "Tick");
        }
    })
}

fn spawn_printer(mut events: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((event, _)) = events.recv().await {
            match transport::render_event(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Failed to render event"),
            }
        }
    })
}

fn show_status(config: &TallyConfig, data_dir: Option<&Path>, json: bool) -> Result<()> {
    let backend = open_backend(config, data_dir)?;
    if !backend.is_persistent() {
        bail!("Status requires a persistent storage backend");
    }
    let store = BackendCounterStore::new(backend);
    let states = store.list_states().context("Failed to read counters")?;

    let periods: HashMap<InstanceKey, f64> = config
        .rules
        .iter()
        .map(|rule| (rule.key(), rule.config.period))
        .collect();

    if json {
        let rows: Vec<serde_json::Value> = states
            .iter()
            .map(|(key, state)| {
                serde_json::json!({
                    "rule": key.to_string(),
                    "lastCounter": state.last_counter,
                    "subCounter": state.sub_counter,
                    "lastResetAt": state.last_reset_at,
                    "period": periods.get(key),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if states.is_empty() {
        println!("No counters stored.");
        return Ok(());
    }

    println!(
        "{:<40} {:>12} {:>12} {:>8}  LAST RESET",
        "RULE", "LAST", "SUB", "CYCLE"
    );
    for (key, state) in &states {
        let last = state
            .last_counter
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let progress = periods
            .get(key)
            .map(|period| format!("{:.0}%", state.sub_counter / period * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:>12} {:>12} {:>8}  {}",
            key.to_string(),
            last,
            state.sub_counter,
            progress,
            state.last_reset_at.to_rfc3339()
        );
    }
    Ok(())
}

fn validate(config: &TallyConfig) -> Result<()> {
    config.validate()?;
    println!(
        "Configuration OK: {} rules, {} presets, {} signals",
        config.rules.len(),
        config.presets.len(),
        config.signals.len()
    );
    Ok(())
}
