//! `prefsync` command line
//!
//! - `simulate`: two contexts edit shared settings against a flaky backend
//!   and must converge
//! - `config`: print the effective configuration as TOML

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use prefsync_core::{SettingsMap, SyncConfig};
use prefsync_engine::backend::{FlakyBackend, InMemoryBackend, SettingsBackend};
use prefsync_engine::broadcast::ChannelHub;
use prefsync_engine::{SyncEngine, SyncStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const KEYS: &[&str] = &["menu_color", "menu_width", "font_size", "sidebar_visible"];

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_name("FILE")
        .help("TOML file overriding the default configuration");

    Command::new("prefsync")
        .version(prefsync_engine::VERSION)
        .about("Settings synchronization engine diagnostics")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("simulate")
                .about("Run two contexts against an unreliable in-memory backend")
                .arg(
                    Arg::new("edits")
                        .long("edits")
                        .default_value("40")
                        .value_parser(value_parser!(u32))
                        .help("Number of edits to perform"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.2")
                        .value_parser(value_parser!(f64))
                        .help("Fraction of backend calls that fail"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(config_arg),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("config", args)) => {
            let config = load_config(args)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn load_config(args: &ArgMatches) -> Result<SyncConfig> {
    let Some(path) = args.get_one::<String>("config") else {
        return Ok(SyncConfig::default());
    };
    read_config(Path::new(path))
}

fn read_config(path: &Path) -> Result<SyncConfig> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    SyncConfig::from_toml_str(&source).with_context(|| format!("loading {}", path.display()))
}

/// Timings short enough for an interactive run
fn simulation_config() -> SyncConfig {
    SyncConfig::new()
        .with_debounce(Duration::from_millis(30))
        .with_flush_interval(Duration::from_millis(20))
        .with_retry_delays(Duration::from_millis(50), Duration::from_millis(400))
        .with_max_retries(5)
        .with_request_timeout(Duration::from_secs(2))
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    edits: u32,
    failure_rate: f64,
    seed: u64,
    converged: bool,
    backend: SettingsMap,
    context_a: SettingsMap,
    context_b: SettingsMap,
    unsaved_a: Vec<String>,
    unsaved_b: Vec<String>,
    stats_a: SyncStats,
    stats_b: SyncStats,
}

async fn simulate(args: &ArgMatches) -> Result<()> {
    let edits = args.get_one::<u32>("edits").copied().unwrap_or(40);
    let failure_rate = args.get_one::<f64>("failure-rate").copied().unwrap_or(0.2);
    let seed = args.get_one::<u64>("seed").copied().unwrap_or(42);
    let as_json = args.get_flag("json");
    let config = match args.get_one::<String>("config") {
        Some(path) => read_config(Path::new(path))?,
        None => simulation_config(),
    };

    let defaults: SettingsMap = [
        ("menu_color".to_string(), json!("#333333")),
        ("menu_width".to_string(), json!(240)),
        ("font_size".to_string(), json!(14)),
        ("sidebar_visible".to_string(), json!(true)),
    ]
    .into_iter()
    .collect();

    let store = Arc::new(InMemoryBackend::with_defaults(defaults.clone()));
    let backend: Arc<dyn SettingsBackend> =
        Arc::new(FlakyBackend::new(Arc::clone(&store), failure_rate, seed));
    let hub = ChannelHub::new();

    let build = |name: &str| -> Result<Arc<SyncEngine>> {
        SyncEngine::builder()
            .config(config.clone())
            .backend(Arc::clone(&backend), format!("sim-{name}"))
            .transport(Arc::new(hub.transport()))
            .defaults(defaults.clone())
            .build()
            .with_context(|| format!("building context {name}"))
    };
    let a = build("a")?;
    let b = build("b")?;
    a.initialize().await;
    b.initialize().await;

    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..edits {
        let engine = if rng.random_bool(0.5) { &a } else { &b };
        let key = KEYS[rng.random_range(0..KEYS.len())];
        let value = match key {
            "menu_color" => json!(format!("#{:06x}", rng.random_range(0..0x0100_0000u32))),
            "sidebar_visible" => json!(rng.random_bool(0.5)),
            _ => json!(rng.random_range(8..400u32)),
        };
        if let Err(error) = engine.edit(key, value) {
            tracing::warn!(key, %error, "edit refused");
        }
        tokio::time::sleep(Duration::from_millis(rng.random_range(0..25))).await;
    }

    a.flush_now().await;
    b.flush_now().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while (a.queue_len() > 0 || b.queue_len() > 0) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the last broadcasts land
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = SimulationSummary {
        edits,
        failure_rate,
        seed,
        converged: false,
        backend: store.data(),
        context_a: a.snapshot(),
        context_b: b.snapshot(),
        unsaved_a: a.shutdown().await,
        unsaved_b: b.shutdown().await,
        stats_a: a.stats(),
        stats_b: b.stats(),
    };
    let summary = SimulationSummary {
        converged: summary.unsaved_a.is_empty()
            && summary.unsaved_b.is_empty()
            && summary.context_a == summary.backend
            && summary.context_b == summary.backend,
        ..summary
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    if !summary.converged {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &SimulationSummary) {
    println!("Simulation");
    println!("==========");
    println!("Edits: {}", summary.edits);
    println!("Failure rate: {}", summary.failure_rate);
    println!("Seed: {}", summary.seed);
    println!();
    println!("{:<18} {:<12} {:<12} {:<12}", "key", "backend", "context a", "context b");
    for key in summary.backend.keys() {
        let show = |map: &SettingsMap| map.get(key).map_or_else(|| "-".to_string(), ToString::to_string);
        println!(
            "{:<18} {:<12} {:<12} {:<12}",
            key,
            show(&summary.backend),
            show(&summary.context_a),
            show(&summary.context_b)
        );
    }
    println!();
    for (name, stats) in [("a", &summary.stats_a), ("b", &summary.stats_b)] {
        println!("Context {name}:");
        println!("  Batches sent: {}", stats.batches_sent);
        println!("  Keys committed: {}", stats.keys_committed);
        println!("  Retries scheduled: {}", stats.retries_scheduled);
        println!("  Terminal failures: {}", stats.terminal_failures);
        println!("  Broadcasts sent/applied: {}/{}", stats.broadcasts_sent, stats.broadcasts_applied);
        println!("  Echoes suppressed: {}", stats.echoes_suppressed);
    }
    println!();
    println!("Converged: {}", if summary.converged { "YES" } else { "NO" });
}
