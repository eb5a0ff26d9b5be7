use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use nasa_harvest::{
    check_credentials, load_env_file, load_file_config, HarvestConfig, Harvester, PowerRequest,
    RoverRequest,
};
use nasa_sources::RoverSelector;
use nasa_storage::LOG_FILE;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nasa-harvester")]
#[command(about = "Harvest NASA open data into a local catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, value_enum, default_value_t = Source::All)]
    source: Source,

    /// Days back from today for APOD and NEO.
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..))]
    days: u32,

    /// Data directory; overrides NASA_DATA_DIR.
    #[arg(long)]
    output: Option<PathBuf>,

    /// YAML overrides for endpoints, plan, fallback sols and timeouts.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    #[arg(long, default_value = "curiosity")]
    rover: String,

    #[arg(long, conflicts_with = "earth_date")]
    sol: Option<u32>,

    #[arg(long)]
    earth_date: Option<NaiveDate>,

    #[arg(long)]
    camera: Option<String>,

    #[arg(long, default_value_t = 25)]
    limit: usize,

    #[arg(long, allow_negative_numbers = true)]
    lat: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    lon: Option<f64>,

    #[arg(long)]
    start: Option<NaiveDate>,

    #[arg(long)]
    end: Option<NaiveDate>,

    /// Directory name for POWER output; defaults to `<lat>_<lon>`.
    #[arg(long)]
    location: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe the configured credentials and print a JSON report.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    Apod,
    Mars,
    Neo,
    Power,
    All,
}

impl Cli {
    fn rover_request(&self) -> RoverRequest {
        let selector = match (self.sol, self.earth_date) {
            (Some(sol), _) => RoverSelector::Sol(sol),
            (None, Some(date)) => RoverSelector::EarthDate(date),
            (None, None) => RoverSelector::Latest,
        };
        RoverRequest {
            rover: self.rover.clone(),
            selector,
            camera: self.camera.clone(),
            limit: self.limit,
        }
    }

    fn power_request(&self) -> Result<PowerRequest> {
        let (Some(lat), Some(lon), Some(start), Some(end)) =
            (self.lat, self.lon, self.start, self.end)
        else {
            bail!("--source power requires --lat, --lon, --start and --end");
        };
        Ok(PowerRequest {
            lat,
            lon,
            start,
            end,
            location_name: self.location.clone(),
        })
    }
}

fn build_config(cli: &Cli) -> Result<HarvestConfig> {
    let mut config = HarvestConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.with_file(load_file_config(path)?);
    }
    if let Some(output) = &cli.output {
        config.data_dir = output.clone();
    }
    Ok(config)
}

/// stderr plus an append-mode `harvest.log` in the data directory.
fn init_tracing(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let log_path = data_dir.join(LOG_FILE);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(log_file)))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_pairs = load_env_file(&cli.env_file)?;
    let config = build_config(&cli)?;
    init_tracing(&config.data_dir)?;
    match env_pairs {
        Some(count) => info!(path = %cli.env_file.display(), "loaded {count} env entries"),
        None => warn!(path = %cli.env_file.display(), "env file not found"),
    }
    if config.uses_demo_key() {
        warn!("NASA_API_KEY not set; using rate-limited DEMO_KEY");
    }

    let mut harvester = Harvester::open(config).await?;

    if let Some(Commands::Check) = cli.command {
        let report = check_credentials(harvester.http(), harvester.config()).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match cli.source {
        Source::All => {
            let results = harvester.harvest_all().await;
            let failed = results
                .iter()
                .filter(|(_, outcome)| outcome.error().is_some())
                .count();
            if failed > 0 {
                warn!("{failed} of {} sources failed", results.len());
            }
        }
        Source::Apod => {
            harvester.harvest_apod(cli.days).await?;
        }
        Source::Mars => {
            harvester.harvest_mars_rover(cli.rover_request()).await?;
        }
        Source::Neo => {
            harvester.harvest_neo(cli.days).await?;
        }
        Source::Power => {
            harvester.harvest_power_climate(cli.power_request()?).await?;
        }
    }

    let banner = "=".repeat(50);
    println!("\n{banner}\nHARVEST COMPLETE\n{banner}");
    println!("{}", serde_json::to_string_pretty(harvester.catalog())?);
    Ok(())
}
