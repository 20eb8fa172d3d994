//! Adaptive Trader
//!
//! Runs the trading agent against historical bars with a paper broker:
//! - `run` loops cycles until Ctrl-C or the end of the data
//! - `cycle` executes a single cycle
//! - `size` prints a position size breakdown under the current settings
//! - `reflect` feeds a reflection file to the adaptive controller
//! - `status` shows persisted settings, lots and the latest digest

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use adaptive_trader::agent::{MarketData, OfflineAdvisor, PaperBroker, ReplayMarketData, TradingAgent};
use adaptive_trader::config::AppConfig;
use adaptive_trader::persistence::StateFile;
use adaptive_trader::sizing::{evaluate, SizingParams, SizingRequest};
use adaptive_trader::telemetry::{init_logging, init_metrics};
use adaptive_trader::utils::helpers::format_usd;
use adaptive_trader::utils::TradeSide;
use adaptive_trader::{AgentState, RiskSettings};

/// Events and anomalies listed by `status`
const STATUS_EVENTS: usize = 10;

/// Adaptive Trader - advisor-driven trading with self-tuning risk
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Force paper trading mode
    #[arg(long)]
    paper: bool,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run cycles until interrupted or out of data
    Run {
        /// Override the configured cycle interval
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Execute a single cycle
    Cycle,
    /// Compute a position size
    Size {
        #[arg(long)]
        portfolio: f64,
        #[arg(long)]
        cash: f64,
        #[arg(long)]
        price: f64,
        #[arg(long, value_enum, default_value = "buy")]
        side: SideArg,
        #[arg(long, default_value_t = 0.0)]
        sentiment: f64,
        #[arg(long)]
        stop: Option<f64>,
        #[arg(long)]
        atr: Option<f64>,
    },
    /// Feed a reflection text file to the adaptive controller
    Reflect {
        #[arg(long)]
        text: PathBuf,
        /// Cycle number to attribute the run to
        #[arg(long)]
        cycle: Option<u64>,
    },
    /// Show persisted state
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for TradeSide {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => TradeSide::Buy,
            SideArg::Sell => TradeSide::Sell,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(&args.config)?;
    if args.paper {
        config.paper_trading = true;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    let _log_guard = init_logging(&config.telemetry)?;
    info!("Starting Adaptive Trader v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Run { interval_secs } => {
            if config.telemetry.enable_metrics {
                init_metrics(config.telemetry.metrics_port)?;
                info!("Metrics server started on port {}", config.telemetry.metrics_port);
            }
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.trading.cycle_interval_secs));
            let (_market, agent) = build_agent(config)?;
            agent.run(interval).await?;
        }
        Command::Cycle => {
            let (market, agent) = build_agent(config)?;
            if !market.advance() {
                bail!("No bars left to replay");
            }
            let report = agent.run_cycle().await?;
            for outcome in &report.outcomes {
                println!(
                    "{}: {} {} ({})",
                    outcome.symbol, outcome.decision.action, outcome.decision.size, outcome.decision.reason
                );
            }
        }
        Command::Size {
            portfolio,
            cash,
            price,
            side,
            sentiment,
            stop,
            atr,
        } => {
            let settings = load_settings(&config)?;
            let request = SizingRequest {
                portfolio_value: portfolio,
                cash_available: cash,
                asset_price: price,
                side: side.into(),
                sentiment,
                stop_loss_price: stop,
                atr,
            };
            match evaluate(&SizingParams::from(&settings), &request) {
                Ok(breakdown) => println!("{}", serde_json::to_string_pretty(&breakdown)?),
                Err(rejection) => println!("0 shares: {}", rejection),
            }
        }
        Command::Reflect { text, cycle } => {
            let reflection =
                std::fs::read_to_string(&text).with_context(|| format!("Failed to read reflection: {:?}", text))?;
            let (_market, agent) = build_agent(config)?;
            let report = agent.adapt(cycle.unwrap_or_else(|| agent.current_cycle()), &reflection)?;
            println!("{}", serde_json::to_string_pretty(&report.events)?);
            if report.skipped {
                println!("Skipped: no resolved trades to evaluate");
            }
        }
        Command::Status => print_status(&config)?,
    }

    Ok(())
}

/// Replay resumes after the bars consumed by earlier cycles
fn build_agent(config: AppConfig) -> Result<(Arc<ReplayMarketData>, TradingAgent)> {
    if !config.paper_trading {
        bail!("Only paper trading is supported; set paper_trading: true or pass --paper");
    }
    let config = Arc::new(config);
    let market = Arc::new(ReplayMarketData::load(
        Path::new(&config.trading.bars_dir),
        &config.trading.symbols,
        config.trading.lookback_bars,
    )?);
    let broker = Arc::new(PaperBroker::new(config.trading.starting_cash, market.clone()));
    let agent = TradingAgent::new(config, market.clone(), Arc::new(OfflineAdvisor), broker)?;
    for _ in 0..agent.current_cycle() {
        market.advance();
    }
    Ok((market, agent))
}

fn load_state(config: &AppConfig) -> Result<AgentState> {
    let file: StateFile<AgentState> = StateFile::new(config.agent_state_path());
    Ok(file.load()?)
}

fn load_settings(config: &AppConfig) -> Result<RiskSettings> {
    let state = load_state(config)?;
    let mut values = config.initial_values();
    values.extend(state.risk);
    Ok(RiskSettings::with_values(&config.param_specs(), &values))
}

fn print_status(config: &AppConfig) -> Result<()> {
    let state = load_state(config)?;
    let settings = load_settings(config)?;

    println!("Cycle: {}", state.cycle);
    println!("Realized P&L: {}", format_usd(state.realized_pl));
    println!("Risk parameters:");
    for param in settings.iter() {
        println!("  {:<36} {:>10.4}  [{}, {}]", param.key.as_str(), param.value, param.min(), param.max());
    }
    println!("Open lots: {}", state.lots.len());
    for lot in &state.lots {
        println!("  {} {} {} @ {:.2}", lot.symbol, lot.side, lot.qty, lot.entry_price);
    }
    println!(
        "Adaptation runs: {}, anomalies: {}",
        state.controller.runs,
        state.controller.anomalies.len()
    );
    let trail = &state.controller.audit_trail;
    println!("Recent adaptation events:");
    for event in &trail[trail.len().saturating_sub(STATUS_EVENTS)..] {
        println!("  {}", event.summary());
    }
    let anomalies = &state.controller.anomalies;
    println!("Recent anomalies:");
    for anomaly in &anomalies[anomalies.len().saturating_sub(STATUS_EVENTS)..] {
        println!("  [cycle {}] {}: {}", anomaly.cycle, anomaly.kind, anomaly.details);
    }
    if let Some(digest) = state.controller.latest_digest() {
        println!("\n{}", digest.text);
    }
    Ok(())
}
