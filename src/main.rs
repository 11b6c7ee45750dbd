use anyhow::{Context, Result};
use breakout_engine::trading_core::{
    data, EventLog, HigherTimeframeSource, InMemoryHtfSource, LiveClock, LiveDriver, ReplayDriver,
    StrategyEngine,
};
use breakout_engine::BreakoutConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "breakout")]
#[command(about = "Pivot breakout confirmation engine (replay and live)")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Strategy config JSON; missing fields take defaults
    #[arg(short, long, global = true, env = "BREAKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Scanner output: JSON object of symbol -> pivot levels
    #[arg(short, long, global = true, env = "BREAKOUT_SCANNER", default_value = "scanner.json")]
    scanner: PathBuf,

    /// Hourly bars for the higher-timeframe filter (.json/.csv, optionally .zst)
    #[arg(long, global = true)]
    htf: Option<PathBuf>,

    /// Write every strategy event to this file as JSON lines
    #[arg(long, global = true)]
    events: Option<PathBuf>,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run historical bars through the engine
    Replay {
        /// Bars keyed by symbol (.json, .json.zst, .csv, .csv.zst)
        #[arg(short, long)]
        bars: PathBuf,
    },

    /// Aggregate a tick stream (CSV file or stdin) into bars as it arrives
    Live {
        /// Tick CSV with columns symbol,timestamp,price,volume; "-" reads stdin
        #[arg(short, long, default_value = "-")]
        ticks: PathBuf,

        /// Timer cycle for closing quiet bars and refreshing HTF data (ms)
        #[arg(long, default_value = "1000")]
        cycle_ms: u64,

        /// Close bars on tick time instead of the wall clock (recorded feeds)
        #[arg(long)]
        data_clock: bool,
    },
}

fn print_summary(log: &EventLog) {
    let summary = log.summary();
    println!("\n═══════════════════════════════════════════════════════════");
    println!("                    SESSION SUMMARY                        ");
    println!("═══════════════════════════════════════════════════════════");
    println!("Breakout attempts: {}", summary.attempts);
    println!("Signals:           {}", summary.signals);
    for (path, count) in &summary.signals_by_path {
        println!("  {:<18} {}", path, count);
    }
    if !summary.filter_rejections.is_empty() {
        println!("Filter rejections:");
        for (filter, count) in &summary.filter_rejections {
            println!("  {:<18} {}", filter, count);
        }
    }
    println!("Dropped events:    {}", summary.dropped);
    println!("Symbol faults:     {}", summary.faults);
    println!("═══════════════════════════════════════════════════════════");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let default_level = if args.verbose { "breakout_engine=debug" } else { "breakout_engine=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();

    let mut config = match &args.config {
        Some(path) => BreakoutConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => BreakoutConfig::default(),
    };

    let htf_source = match &args.htf {
        Some(path) => Some(InMemoryHtfSource::new(data::load_bars(path)?)),
        None => {
            if config.filters.htf_momentum {
                warn!("No --htf data given, disabling the higher-timeframe filter");
                config.filters.htf_momentum = false;
            }
            None
        }
    };
    let htf = htf_source.as_ref().map(|s| s as &dyn HigherTimeframeSource);

    let levels = data::load_scanner(&args.scanner)?;
    let mut engine = StrategyEngine::new(config, levels)?;

    let log = match args.command {
        Commands::Replay { bars } => {
            let bars = data::load_bars(&bars)?;
            ReplayDriver::new(bars).run(&mut engine, htf)
        }
        Commands::Live { ticks, cycle_ms, data_clock } => {
            let reader = data::open_ticks(&ticks)?;
            let (market_tx, market_rx) = mpsc::channel(10_000);
            let feeder = tokio::task::spawn_blocking(move || {
                let mut sent = 0u64;
                for event in data::tick_events(reader) {
                    match event {
                        Ok(event) => {
                            if market_tx.blocking_send(event).is_err() {
                                break;
                            }
                            sent += 1;
                        }
                        Err(e) => warn!("Skipping tick row: {:#}", e),
                    }
                }
                sent
            });

            // Signals go to stdout as JSON lines for the execution layer
            let (signal_tx, mut signal_rx) = mpsc::channel(256);
            let printer = tokio::spawn(async move {
                while let Some(signal) = signal_rx.recv().await {
                    match serde_json::to_string(&signal) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to encode signal: {}", e),
                    }
                }
            });

            let clock = if data_clock { LiveClock::DataTime } else { LiveClock::System };
            let driver = LiveDriver::new(std::time::Duration::from_millis(cycle_ms), clock);
            let log = driver.run(&mut engine, market_rx, htf, Some(signal_tx)).await?;

            let sent = feeder.await?;
            printer.await?;
            info!("Consumed {} ticks", sent);
            log
        }
    };

    if let Some(path) = &args.events {
        log.save_jsonl(path)?;
        info!("Wrote {} events to {:?}", log.events().len(), path);
    }
    print_summary(&log);

    Ok(())
}
