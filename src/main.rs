mod config;
mod data;
mod error;
mod portfolio;
mod returns;
mod sampler;
mod webui;

use clap::{Parser, ValueEnum};
use config::{ParallelMode, SimulationConfig};
use data::PriceTable;
use std::io;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, ValueEnum)]
enum ParallelChoice {
    Auto,
    Always,
    Never,
}

impl From<ParallelChoice> for ParallelMode {
    fn from(value: ParallelChoice) -> Self {
        match value {
            ParallelChoice::Auto => ParallelMode::Auto,
            ParallelChoice::Always => ParallelMode::Always,
            ParallelChoice::Never => ParallelMode::Never,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Frontier-Sim: max-Sharpe portfolio search by Monte Carlo sampling of random weights",
    after_help = "EXAMPLES:
    # Fetch daily prices and sample 5000 portfolios
    cargo run --release -- --symbols \"AAPL MSFT GOOGL\" --start 2020-01-01 --end 2024-01-01

    # Reproducible run from a local price table, JSON to stdout
    cargo run --release -- --prices prices.csv --trials 20000 --seed 42 --json

    # Serve the JSON API
    cargo run --release -- --webui --webui-port 8080"
)]
struct Args {
    /// Instruments separated by spaces or commas (e.g. \"AAPL MSFT GOOGL\")
    #[arg(long)]
    symbols: Option<String>,

    /// First date of the price history (YYYY-MM-DD). Required with --symbols.
    #[arg(long)]
    start: Option<chrono::NaiveDate>,

    /// End of the price history, exclusive (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<chrono::NaiveDate>,

    /// CSV price table with header Date,<symbol>,<symbol>,... instead of fetching
    #[arg(long, conflicts_with = "symbols")]
    prices: Option<PathBuf>,

    /// Number of random weight vectors to draw (default: 5000)
    #[arg(long)]
    trials: Option<usize>,

    /// Trading days per year used for annualization (default: 252)
    #[arg(long)]
    trading_days: Option<u32>,

    /// Seed for a reproducible run. Omit to seed from OS entropy.
    #[arg(long)]
    seed: Option<u64>,

    /// Parallel sampling (auto = only above 10,000 trials)
    #[arg(long, value_enum)]
    parallel: Option<ParallelChoice>,

    /// Print the full report as JSON instead of the summary table
    #[arg(long)]
    json: bool,

    /// Write the full JSON report to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the JSON API instead of running once
    #[arg(long)]
    webui: bool,

    /// WebUI server port
    #[arg(long, default_value_t = 8080)]
    webui_port: u16,
}

impl Args {
    fn simulation_config(&self) -> SimulationConfig {
        let mut cfg = SimulationConfig::default().with_env_overrides();
        if let Some(trials) = self.trials {
            cfg.trials = trials;
        }
        if let Some(days) = self.trading_days {
            cfg.trading_days_per_year = days;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if let Some(parallel) = self.parallel.clone() {
            cfg.parallel = parallel.into();
        }
        cfg
    }
}

async fn load_prices(args: &Args) -> anyhow::Result<PriceTable> {
    if let Some(path) = &args.prices {
        return PriceTable::from_csv_path(path);
    }

    let raw = args
        .symbols
        .as_deref()
        .ok_or(anyhow::anyhow!("provide --symbols or --prices"))?;
    let symbols = data::parse_symbols(raw)?;
    if symbols.is_empty() {
        return Err(anyhow::anyhow!("--symbols did not contain any instrument"));
    }
    let start = args
        .start
        .ok_or(anyhow::anyhow!("--start is required with --symbols"))?;
    let end = args
        .end
        .unwrap_or_else(|| chrono::Local::now().date_naive());

    info!("Fetching {:?} from {} to {}", symbols, start, end);
    data::fetch_price_table(&symbols, start, end).await
}

fn write_report(args: &Args, report: &portfolio::SimulationReport) -> anyhow::Result<()> {
    if let Some(path) = &args.output {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)?;
        info!("Wrote report to {}", path.display());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        portfolio::print_report(report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("frontier_sim=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();
    let sim_config = args.simulation_config();

    if let Err(e) = sim_config.validate() {
        error!("{}", e);
        return Ok(());
    }

    if args.webui {
        match webui::run_webui_server(args.webui_port, sim_config).await {
            Ok(_) => info!("WebUI exited."),
            Err(e) => error!("WebUI failed: {}", e),
        }
        return Ok(());
    }

    let prices = match load_prices(&args).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to load prices: {}", e);
            return Ok(());
        }
    };

    match portfolio::run_with_config(&prices, &sim_config) {
        Ok(report) => {
            if let Err(e) = write_report(&args, &report) {
                error!("Failed to write report: {}", e);
            }
        }
        Err(e) => error!("Portfolio optimization failed: {}", e),
    }

    Ok(())
}
