use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use range_breakout::execution::{SimVenue, StaticSignal};
use range_breakout::{Bar, BreakoutEngine, EngineConfig, EngineEvent, SymbolSpec, TickOutcome};

#[derive(Parser, Debug)]
#[command(name = "range-breakout")]
#[command(about = "Opening-range breakout engine with basket profit management")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay historical bars through the engine against a simulated venue
    Replay {
        /// Engine configuration file (TOML)
        #[arg(short, long, env = "BREAKOUT_CONFIG")]
        config: Option<PathBuf>,

        /// Named preset used when no config file is given (london, new_york)
        #[arg(short, long, default_value = "london")]
        preset: String,

        /// CSV file with time,open,high,low,close rows
        #[arg(short, long)]
        bars: PathBuf,

        /// Override the configured instrument name
        #[arg(long, env = "BREAKOUT_INSTRUMENT")]
        instrument: Option<String>,

        /// Override the engine identifier stamped on orders
        #[arg(long, env = "BREAKOUT_ENGINE_ID")]
        engine_id: Option<u64>,

        /// Starting account balance
        #[arg(long, default_value = "10000.0")]
        balance: f64,

        /// Spread in pips applied to every bar
        #[arg(long, default_value = "1.0")]
        spread_pips: f64,

        /// Print the final engine snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        /// Engine configuration file (TOML)
        #[arg(short, long, env = "BREAKOUT_CONFIG")]
        config: Option<PathBuf>,

        /// Named preset used when no config file is given
        #[arg(short, long, default_value = "london")]
        preset: String,
    },
}

#[derive(Debug, Deserialize)]
struct BarRow {
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("range_breakout=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Replay {
            config,
            preset,
            bars,
            instrument,
            engine_id,
            balance,
            spread_pips,
            json,
        } => {
            let mut config = load_config(config.as_deref(), &preset)?;
            if let Some(instrument) = instrument {
                config.instrument = instrument;
            }
            if let Some(engine_id) = engine_id {
                config.engine_id = engine_id;
            }
            run_replay(config, &bars, balance, spread_pips, json).await
        }
        Commands::CheckConfig { config, preset } => {
            let config = load_config(config.as_deref(), &preset)?;
            print!("{}", config.to_toml_string()?);
            info!("Configuration OK");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, preset: &str) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config: {:?}", path)),
        None => match EngineConfig::preset(preset) {
            Some(config) => {
                config.validate()?;
                Ok(config)
            }
            None => bail!("Unknown preset '{}'", preset),
        },
    }
}

/// Accepts RFC 3339 or naive "YYYY-MM-DD HH:MM[:SS]" read as UTC
fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|t| t.and_utc())
        .with_context(|| format!("Failed to parse timestamp: {}", raw))
}

fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));

    let mut bars = Vec::new();
    for result in reader.deserialize() {
        let row: BarRow = result.with_context(|| "Failed to parse CSV row")?;
        bars.push(Bar {
            open_time: parse_time(&row.time)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
        });
    }

    bars.sort_by_key(|b| b.open_time);
    debug!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

async fn run_replay(
    config: EngineConfig,
    path: &Path,
    balance: f64,
    spread_pips: f64,
    json: bool,
) -> Result<()> {
    let bars = load_bars(path)?;
    let Some(first) = bars.first() else {
        bail!("No bars in {:?}", path);
    };

    let spec = SymbolSpec::default();
    let venue = SimVenue::new(first.open_time, spec, balance);
    venue.set_spread(spec.pips_to_price(spread_pips));

    info!(
        "Replaying {} bars for {} (engine {}) from {}",
        bars.len(),
        config.instrument,
        config.engine_id,
        first.open_time
    );

    let mut engine = BreakoutEngine::new(
        config,
        venue.clone(),
        venue.clone(),
        StaticSignal::neutral(),
        venue.clone(),
    )
    .context("Failed to start engine")?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event printer lagged by {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let replay = tokio::task::spawn_blocking(move || {
        let mut not_ready = 0usize;
        for bar in bars {
            venue.push_bar(bar);
            if let TickOutcome::DataNotReady { .. } = engine.on_tick() {
                not_ready += 1;
            }
        }
        (engine.snapshot(), venue.balance(), not_ready)
    });

    let (snapshot, final_balance, not_ready) = replay.await.context("Replay task failed")?;
    // Engine dropped with the blocking task, which closes the channel
    printer.await.context("Event printer failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let lifetime = &snapshot.lifetime;
    println!();
    println!("═══ REPLAY SUMMARY ═══");
    println!("Instrument:        {}", snapshot.instrument);
    println!("Ticks:             {} ({} not ready)", snapshot.ticks, not_ready);
    println!("Final phase:       {:?}", snapshot.phase);
    println!("Lifecycle:         {}", snapshot.lifecycle);
    println!("Baskets closed:    {}", lifetime.total_baskets);
    println!("Win rate:          {:.1}%", lifetime.win_rate() * 100.0);
    println!("Total profit:      ${:.2}", lifetime.total_profit);
    println!("Best / worst:      ${:.2} / ${:.2}", lifetime.max_profit, lifetime.max_loss);
    println!(
        "Open basket:       {} (${:.2} of ${:.2})",
        snapshot.basket.id, snapshot.basket.current_profit, snapshot.basket.target_profit
    );
    println!("Balance:           ${:.2} -> ${:.2}", balance, final_balance);
    let failures = snapshot.failures.total();
    if failures > 0 {
        println!("Venue failures:    {}", failures);
    }

    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RangeCommitted { range } => {
            info!("RANGE: {:.5} - {:.5} ({} bars)", range.high, range.low, range.bar_count)
        }
        EngineEvent::PositionOpened {
            side,
            entry_price,
            stop_loss,
            ..
        } => info!("ENTRY: {} @ {:.5} | Stop: {:.5}", side, entry_price, stop_loss),
        EngineEvent::BasketClosed { record } => {
            info!("BASKET {}: {:?} ${:.2}", record.basket.id, record.outcome, record.profit())
        }
        EngineEvent::Flattened {
            reason,
            closed,
            cancelled,
        } => info!("FLAT ({}): {} closed, {} cancelled", reason, closed, cancelled),
        other => debug!("{:?}", other),
    }
}
