//! Harvest orchestration: per-source routines, catalog bookkeeping, config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use nasa_core::{
    ApodSummary, BatchReport, Catalog, GeoPoint, ItemOutcome, NeoStats, RoverPhotoSummary,
    SourceDetail, SourceRecord,
};
use nasa_sources::{
    default_location_name, fetch_apod, fetch_max_sol, fetch_neo_feed, fetch_power_daily,
    fetch_rover_photos, neo_week_file, power_key, power_output_file, power_parameter_series,
    rover_dir, rover_key, summarize_neo_feed, DateWindow, Endpoints, FallbackSols,
    ResolvedSelector, RoverSelector, SourceError, APOD_KEY, DEFAULT_POWER_PARAMETERS, NEO_KEY,
};
use nasa_storage::{
    ArtifactStore, CatalogStore, FetchError, FileCatalogStore, HttpClientConfig, HttpFetcher,
    RequestKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "nasa-harvest";

pub const DEMO_API_KEY: &str = "DEMO_KEY";

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_key} response: {detail}")]
    Malformed { source_key: String, detail: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<SourceError> for HarvestError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Fetch(err) => Self::Fetch(err),
            SourceError::Malformed { source_key, detail } => {
                Self::Malformed { source_key, detail }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

// ----- configuration -----

/// What `harvest_all` runs, in the fixed order APOD, rover, NEO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestPlan {
    pub apod_days: u32,
    pub include_rover: bool,
    pub rover: String,
    pub rover_limit: usize,
    pub neo_days: u32,
}

impl Default for HarvestPlan {
    fn default() -> Self {
        Self {
            apod_days: 7,
            include_rover: true,
            rover: "curiosity".to_string(),
            rover_limit: 10,
            neo_days: 7,
        }
    }
}

/// Optional YAML overrides layered on top of the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarvestFileConfig {
    pub data_dir: Option<PathBuf>,
    pub endpoints: Option<Endpoints>,
    pub fallback_sols: Option<FallbackSols>,
    pub plan: Option<HarvestPlan>,
    pub power_parameters: Option<Vec<String>>,
    pub metadata_timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
}

pub fn load_file_config(path: &Path) -> anyhow::Result<HarvestFileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub api_key: String,
    pub earthdata_token: Option<String>,
    pub user_agent: String,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub endpoints: Endpoints,
    pub fallback_sols: FallbackSols,
    pub plan: HarvestPlan,
    pub power_parameters: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            data_dir: non_empty("NASA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/nasa")),
            api_key: non_empty("NASA_API_KEY").unwrap_or_else(|| DEMO_API_KEY.to_string()),
            earthdata_token: non_empty("EARTHDATA_TOKEN").or_else(|| non_empty("NASA_TOKEN")),
            user_agent: non_empty("NASA_HARVESTER_USER_AGENT")
                .unwrap_or_else(|| format!("nasa-harvester/{}", env!("CARGO_PKG_VERSION"))),
            metadata_timeout_secs: non_empty("NASA_METADATA_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            download_timeout_secs: non_empty("NASA_DOWNLOAD_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            endpoints: Endpoints::default(),
            fallback_sols: FallbackSols::default(),
            plan: HarvestPlan::default(),
            power_parameters: DEFAULT_POWER_PARAMETERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn with_file(mut self, file: HarvestFileConfig) -> Self {
        if let Some(data_dir) = file.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(endpoints) = file.endpoints {
            self.endpoints = endpoints;
        }
        if let Some(fallback_sols) = file.fallback_sols {
            self.fallback_sols = fallback_sols;
        }
        if let Some(plan) = file.plan {
            self.plan = plan;
        }
        if let Some(parameters) = file.power_parameters.filter(|p| !p.is_empty()) {
            self.power_parameters = parameters;
        }
        if let Some(secs) = file.metadata_timeout_secs {
            self.metadata_timeout_secs = secs;
        }
        if let Some(secs) = file.download_timeout_secs {
            self.download_timeout_secs = secs;
        }
        self
    }

    pub fn uses_demo_key(&self) -> bool {
        self.api_key == DEMO_API_KEY
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// `KEY=VALUE` lines; blank, `#` and `=`-less lines are skipped. Splits on the
/// first `=`.
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Export the pairs in `path` into the process environment. `Ok(None)` when
/// the file does not exist; callers decide whether that is worth logging.
pub fn load_env_file(path: &Path) -> anyhow::Result<Option<usize>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let pairs = parse_env_file(&text);
    for (key, value) in &pairs {
        std::env::set_var(key, value);
    }
    Ok(Some(pairs.len()))
}

// ----- reports -----

#[derive(Debug, Clone, Serialize)]
pub struct ApodReport {
    pub items: Vec<ApodSummary>,
    pub downloads: BatchReport,
}

/// How a rover's sol was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorSource {
    Requested,
    Manifest,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoverReport {
    pub rover: String,
    pub selector: String,
    pub resolution: SelectorSource,
    pub output_dir: PathBuf,
    pub photos: Vec<RoverPhotoSummary>,
    pub downloads: BatchReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeoReport {
    pub stats: NeoStats,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerReport {
    pub location_name: String,
    pub output: PathBuf,
    pub response: JsonValue,
}

/// One entry of the `harvest_all` result mapping.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SourceOutcome {
    Apod(ApodReport),
    Rover(RoverReport),
    Neo(NeoReport),
    Failed { error: String },
}

impl SourceOutcome {
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    fn from_result<T>(
        label: &str,
        result: Result<T>,
        wrap: impl FnOnce(T) -> SourceOutcome,
    ) -> Self {
        match result {
            Ok(report) => wrap(report),
            Err(err) => {
                error!("{label} harvest failed: {err}");
                Self::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

// ----- requests -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoverRequest {
    pub rover: String,
    pub selector: RoverSelector,
    pub camera: Option<String>,
    pub limit: usize,
}

impl Default for RoverRequest {
    fn default() -> Self {
        Self::latest("curiosity", 25)
    }
}

impl RoverRequest {
    pub fn latest(rover: impl Into<String>, limit: usize) -> Self {
        Self {
            rover: rover.into(),
            selector: RoverSelector::Latest,
            camera: None,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerRequest {
    pub lat: f64,
    pub lon: f64,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub location_name: Option<String>,
}

// ----- harvester -----

pub struct Harvester<S: CatalogStore> {
    config: HarvestConfig,
    http: HttpFetcher,
    artifacts: ArtifactStore,
    store: S,
    catalog: Catalog,
}

impl Harvester<FileCatalogStore> {
    /// Harvester persisting to `<data-dir>/catalog.json`.
    pub async fn open(config: HarvestConfig) -> anyhow::Result<Self> {
        let store = FileCatalogStore::in_dir(&config.data_dir);
        Self::with_store(config, store).await
    }
}

impl<S: CatalogStore> Harvester<S> {
    pub async fn with_store(config: HarvestConfig, store: S) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let artifacts = ArtifactStore::new(config.data_dir.clone());
        let catalog = store.load().await.context("loading catalog")?;
        Ok(Self {
            config,
            http,
            artifacts,
            store,
            catalog,
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Replace one source entry, refresh totals and write the catalog. The
    /// in-memory catalog only changes once the save succeeded.
    async fn record(&mut self, key: String, detail: SourceDetail) -> Result<()> {
        let now = Utc::now();
        let mut next = self.catalog.clone();
        next.record(key, SourceRecord::new(now, detail));
        let totals = self.artifacts.scan_totals();
        next.set_totals(totals.file_count, totals.total_bytes);
        next.touch(now);
        self.store.save(&next).await.context("saving catalog")?;
        self.catalog = next;
        Ok(())
    }

    /// Fetch `url` into `relative_path` unless it is already cached. Failures
    /// are reported, never raised.
    async fn download_once(&self, url: &str, relative_path: &Path) -> ItemOutcome {
        match self.artifacts.exists(relative_path).await {
            Ok(true) => {
                return ItemOutcome::Cached {
                    path: relative_path.to_path_buf(),
                }
            }
            Ok(false) => {}
            Err(err) => return skipped(url, format!("{err:#}")),
        }

        info!(path = %relative_path.display(), "downloading {url}");
        let response = match self.http.get_bytes(url, RequestKind::Download).await {
            Ok(response) => response,
            Err(err) => return skipped(url, err.to_string()),
        };
        match self
            .artifacts
            .store_if_absent(relative_path, &response.body)
            .await
        {
            Ok(stored) => ItemOutcome::Stored {
                path: stored.relative_path,
                bytes: stored.byte_size,
            },
            Err(err) => skipped(url, format!("{err:#}")),
        }
    }

    pub async fn harvest_apod(&mut self, days: u32) -> Result<ApodReport> {
        let window = date_window(self.today(), days)?;
        async {
            info!("harvesting APOD for last {days} days");
            let entries =
                fetch_apod(&self.http, &self.config.endpoints, &self.config.api_key, &window)
                    .await?;

            let mut report = ApodReport {
                items: Vec::with_capacity(entries.len()),
                downloads: BatchReport::default(),
            };
            for entry in &entries {
                self.artifacts
                    .write_json(&entry.metadata_path(), &entry.raw)
                    .await?;
                if let (Some(path), Some(url)) = (entry.image_path(), entry.image_url()) {
                    let outcome = self.download_once(url, &path).await;
                    report.downloads.push(url, outcome);
                }
                report.items.push(entry.summary());
            }

            self.record(
                APOD_KEY.to_string(),
                SourceDetail::Apod {
                    items_harvested: report.items.len(),
                    date_range: window.as_array(),
                },
            )
            .await?;
            info!("APOD harvest complete: {} items", report.items.len());
            Ok::<_, HarvestError>(report)
        }
        .instrument(info_span!("harvest", source = APOD_KEY))
        .await
    }

    async fn resolve_selector(
        &self,
        rover: &str,
        selector: RoverSelector,
    ) -> (ResolvedSelector, SelectorSource) {
        match selector {
            RoverSelector::Sol(sol) => (ResolvedSelector::Sol(sol), SelectorSource::Requested),
            RoverSelector::EarthDate(date) => {
                (ResolvedSelector::EarthDate(date), SelectorSource::Requested)
            }
            RoverSelector::Latest => {
                match fetch_max_sol(&self.http, &self.config.endpoints, &self.config.api_key, rover)
                    .await
                {
                    Ok(sol) => {
                        info!("latest sol for {rover}: {sol}");
                        (ResolvedSelector::Sol(sol), SelectorSource::Manifest)
                    }
                    Err(err) => {
                        let sol = self.config.fallback_sols.sol_for(rover);
                        warn!("manifest fetch failed: {err}; using fallback sol {sol}");
                        (ResolvedSelector::Sol(sol), SelectorSource::Fallback)
                    }
                }
            }
        }
    }

    pub async fn harvest_mars_rover(&mut self, request: RoverRequest) -> Result<RoverReport> {
        let rover = request.rover.trim().to_ascii_lowercase();
        if rover.is_empty() {
            return Err(HarvestError::InvalidRequest("rover name is empty".into()));
        }
        let key = rover_key(&rover);
        async {
            info!("harvesting {rover} photos");
            let (selector, resolution) = self.resolve_selector(&rover, request.selector).await;
            let output_dir = rover_dir(&rover, &selector);
            let absolute_dir = self.artifacts.absolute_path(&output_dir);
            fs::create_dir_all(&absolute_dir)
                .await
                .with_context(|| format!("creating {}", absolute_dir.display()))?;

            let photos = fetch_rover_photos(
                &self.http,
                &self.config.endpoints,
                &self.config.api_key,
                &rover,
                &selector,
                request.camera.as_deref(),
                request.limit,
            )
            .await?;

            let mut report = RoverReport {
                rover: rover.clone(),
                selector: selector.dir_name(),
                resolution,
                output_dir: output_dir.clone(),
                photos: Vec::with_capacity(photos.len()),
                downloads: BatchReport::default(),
            };
            for photo in &photos {
                let image_path = output_dir.join(photo.file_name());
                let outcome = self.download_once(&photo.img_src, &image_path).await;
                report.downloads.push(photo.img_src.clone(), outcome);

                self.artifacts
                    .write_json(&output_dir.join(photo.metadata_file_name()), &photo.raw)
                    .await?;
                report.photos.push(photo.summary());
            }

            self.record(
                key.clone(),
                SourceDetail::Rover {
                    items_harvested: report.photos.len(),
                    selector: Some(report.selector.clone()),
                },
            )
            .await?;
            info!("Mars {rover} harvest complete: {} photos", report.photos.len());
            Ok::<_, HarvestError>(report)
        }
        .instrument(info_span!("harvest", source = %key))
        .await
    }

    pub async fn harvest_neo(&mut self, days: u32) -> Result<NeoReport> {
        let window = date_window(self.today(), days)?;
        async {
            info!("harvesting NEO data for {days} days");
            let feed = fetch_neo_feed(
                &self.http,
                &self.config.endpoints,
                &self.config.api_key,
                &window,
            )
            .await?;

            let output = neo_week_file(window.end);
            self.artifacts.write_json(&output, &feed).await?;
            let stats = summarize_neo_feed(&feed)?;

            self.record(
                NEO_KEY.to_string(),
                SourceDetail::Neo {
                    stats: stats.clone(),
                },
            )
            .await?;
            info!("NEO harvest complete: {} objects", stats.total_count);
            Ok::<_, HarvestError>(NeoReport { stats, output })
        }
        .instrument(info_span!("harvest", source = NEO_KEY))
        .await
    }

    pub async fn harvest_power_climate(&mut self, request: PowerRequest) -> Result<PowerReport> {
        if request.start > request.end {
            return Err(HarvestError::InvalidRequest(format!(
                "start {} is after end {}",
                request.start, request.end
            )));
        }
        let PowerRequest {
            lat,
            lon,
            start,
            end,
            location_name,
        } = request;
        let location_name = location_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_location_name(lat, lon));
        let key = power_key(&location_name);

        async {
            info!("harvesting POWER data for ({lat}, {lon})");
            let response = fetch_power_daily(
                &self.http,
                &self.config.endpoints,
                lat,
                lon,
                start,
                end,
                &self.config.power_parameters,
            )
            .await?;

            let output = power_output_file(&location_name, start, end);
            self.artifacts.write_json(&output, &response).await?;

            self.record(
                key.clone(),
                SourceDetail::Power {
                    location: GeoPoint { lat, lon },
                    temporal: [start, end],
                },
            )
            .await?;
            info!("POWER harvest complete for {location_name}");
            Ok::<_, HarvestError>(PowerReport {
                location_name: location_name.clone(),
                output,
                response,
            })
        }
        .instrument(info_span!("harvest", source = %key))
        .await
    }

    /// Run the configured plan. Each source is isolated: a failure is recorded
    /// under its key and the remaining sources still run.
    pub async fn harvest_all(&mut self) -> BTreeMap<String, SourceOutcome> {
        let plan = self.config.plan.clone();
        info!("starting full NASA data harvest");
        let mut results = BTreeMap::new();

        let apod = self.harvest_apod(plan.apod_days).await;
        results.insert(
            "apod".to_string(),
            SourceOutcome::from_result("APOD", apod, SourceOutcome::Apod),
        );

        if plan.include_rover {
            let rover = self
                .harvest_mars_rover(RoverRequest::latest(plan.rover.clone(), plan.rover_limit))
                .await;
            results.insert(
                "mars".to_string(),
                SourceOutcome::from_result("Mars", rover, SourceOutcome::Rover),
            );
        }

        let neo = self.harvest_neo(plan.neo_days).await;
        results.insert(
            "neo".to_string(),
            SourceOutcome::from_result("NEO", neo, SourceOutcome::Neo),
        );

        info!("full harvest complete");
        results
    }
}

fn date_window(end: NaiveDate, days: u32) -> Result<DateWindow> {
    if days == 0 {
        return Err(HarvestError::InvalidRequest(
            "day count must be at least 1".into(),
        ));
    }
    DateWindow::ending(end, days).ok_or_else(|| {
        HarvestError::InvalidRequest(format!("{days} days before {end} is out of range"))
    })
}

fn skipped(url: &str, reason: String) -> ItemOutcome {
    warn!("failed to download {url}: {reason}");
    ItemOutcome::Skipped { reason }
}

// ----- credential probes -----

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok { detail: String },
    Failed { error: String },
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialReport {
    pub api_key: String,
    pub power: ProbeOutcome,
    pub earthdata: ProbeOutcome,
}

/// Probe the POWER API and, when a token is configured, Earthdata CMR with
/// bearer auth. Each probe reports on its own.
pub async fn check_credentials(http: &HttpFetcher, config: &HarvestConfig) -> CredentialReport {
    let api_key = if config.uses_demo_key() {
        "DEMO_KEY (rate limited)".to_string()
    } else {
        "set".to_string()
    };

    let power = probe_power(http, &config.endpoints).await;

    let earthdata = match &config.earthdata_token {
        None => ProbeOutcome::NotConfigured,
        Some(token) => {
            let query = [
                ("short_name", "MCD43A4".to_string()),
                ("page_size", "1".to_string()),
            ];
            match http
                .get_json_with_bearer(
                    &config.endpoints.cmr_collections,
                    &query,
                    token,
                    RequestKind::Metadata,
                )
                .await
            {
                Ok(body) => {
                    let entries = body
                        .get("feed")
                        .and_then(|feed| feed.get("entry"))
                        .and_then(JsonValue::as_array)
                        .map_or(0, Vec::len);
                    ProbeOutcome::Ok {
                        detail: format!("token accepted; {entries} collection(s) returned"),
                    }
                }
                Err(err) => ProbeOutcome::Failed {
                    error: err.to_string(),
                },
            }
        }
    };

    CredentialReport {
        api_key,
        power,
        earthdata,
    }
}

async fn probe_power(http: &HttpFetcher, endpoints: &Endpoints) -> ProbeOutcome {
    let (Some(start), Some(end)) = (
        NaiveDate::from_ymd_opt(2025, 1, 1),
        NaiveDate::from_ymd_opt(2025, 1, 3),
    ) else {
        return ProbeOutcome::Failed {
            error: "invalid probe dates".into(),
        };
    };
    match fetch_power_daily(http, endpoints, 25.20, 55.27, start, end, &["T2M".to_string()]).await
    {
        Ok(response) => match power_parameter_series(&response, "T2M") {
            Some(series) => ProbeOutcome::Ok {
                detail: format!("{} daily T2M values", series.len()),
            },
            None => ProbeOutcome::Failed {
                error: "response has no T2M series".into(),
            },
        },
        Err(err) => ProbeOutcome::Failed {
            error: err.to_string(),
        },
    }
}
