//! Request building, wire types and derived paths for the four NASA sources.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{Days, NaiveDate};
use nasa_core::{ApodSummary, ClosestApproach, NeoStats, RoverPhotoSummary};
use nasa_storage::{FetchError, HttpFetcher, RequestKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "nasa-sources";

pub const APOD_KEY: &str = "apod";
pub const NEO_KEY: &str = "neo";

pub const DEFAULT_POWER_PARAMETERS: &[&str] = &[
    "T2M",
    "T2M_MAX",
    "T2M_MIN",
    "PRECTOTCORR",
    "ALLSKY_SFC_SW_DWN",
    "WS2M",
    "RH2M",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_key} response: {detail}")]
    Malformed { source_key: String, detail: String },
}

impl SourceError {
    fn malformed(source_key: &str, detail: impl ToString) -> Self {
        Self::Malformed {
            source_key: source_key.to_string(),
            detail: detail.to_string(),
        }
    }
}

fn decode<T: DeserializeOwned>(source_key: &str, value: JsonValue) -> Result<T, SourceError> {
    serde_json::from_value(value).map_err(|err| SourceError::malformed(source_key, err))
}

/// Remote endpoints. Overridable so harvests can run against a local stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub apod: String,
    pub mars_photos: String,
    pub neo_feed: String,
    pub power_daily_point: String,
    pub cmr_collections: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            apod: "https://api.nasa.gov/planetary/apod".to_string(),
            mars_photos: "https://api.nasa.gov/mars-photos/api/v1".to_string(),
            neo_feed: "https://api.nasa.gov/neo/rest/v1/feed".to_string(),
            power_daily_point: "https://power.larc.nasa.gov/api/temporal/daily/point".to_string(),
            cmr_collections: "https://cmr.earthdata.nasa.gov/search/collections.json".to_string(),
        }
    }
}

impl Endpoints {
    /// Same paths as the public services, served from `base`.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            apod: format!("{base}/planetary/apod"),
            mars_photos: format!("{base}/mars-photos/api/v1"),
            neo_feed: format!("{base}/neo/rest/v1/feed"),
            power_daily_point: format!("{base}/api/temporal/daily/point"),
            cmr_collections: format!("{base}/search/collections.json"),
        }
    }
}

/// Inclusive `[start, end]` query window; `days` back from `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `None` when the start would fall before chrono's earliest date.
    pub fn ending(end: NaiveDate, days: u32) -> Option<Self> {
        let start = end.checked_sub_days(Days::new(u64::from(days)))?;
        Some(Self { start, end })
    }

    pub fn as_array(&self) -> [NaiveDate; 2] {
        [self.start, self.end]
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Keep caller-supplied names from escaping their source directory.
pub fn path_segment(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect::<String>();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Final path segment of a URL with any query or fragment removed.
pub fn url_file_name(url: &str) -> Option<&str> {
    let without_query = url.split(&['?', '#'][..]).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// File extension of the URL's last path segment, `bin` when it has none.
pub fn url_extension(url: &str) -> String {
    url_file_name(url)
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.trim())
        .filter(|ext| !ext.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "bin".to_string())
}

// ----- APOD -----

#[derive(Debug, Clone, Deserialize)]
struct ApodFields {
    date: NaiveDate,
    title: String,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    hdurl: Option<String>,
}

/// One APOD item; `raw` is the record exactly as served.
#[derive(Debug, Clone, PartialEq)]
pub struct ApodEntry {
    pub date: NaiveDate,
    pub title: String,
    pub media_type: Option<String>,
    pub url: Option<String>,
    pub hdurl: Option<String>,
    pub raw: JsonValue,
}

impl ApodEntry {
    pub fn from_value(raw: JsonValue) -> Result<Self, SourceError> {
        let fields: ApodFields = decode(APOD_KEY, raw.clone())?;
        Ok(Self {
            date: fields.date,
            title: fields.title,
            media_type: fields.media_type,
            url: fields.url,
            hdurl: fields.hdurl,
            raw,
        })
    }

    pub fn is_image(&self) -> bool {
        self.media_type.as_deref() == Some("image")
    }

    /// High resolution when offered.
    pub fn image_url(&self) -> Option<&str> {
        self.hdurl.as_deref().or(self.url.as_deref())
    }

    pub fn month_dir(&self) -> PathBuf {
        PathBuf::from(APOD_KEY)
            .join(self.date.format("%Y").to_string())
            .join(self.date.format("%m").to_string())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.month_dir().join(format!("{}.json", format_date(self.date)))
    }

    pub fn image_path(&self) -> Option<PathBuf> {
        if !self.is_image() {
            return None;
        }
        let url = self.image_url()?;
        Some(
            self.month_dir()
                .join(format!("{}.{}", format_date(self.date), url_extension(url))),
        )
    }

    pub fn summary(&self) -> ApodSummary {
        ApodSummary {
            date: self.date,
            title: self.title.clone(),
            media_type: self
                .media_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

pub fn apod_query(api_key: &str, window: &DateWindow) -> Vec<(&'static str, String)> {
    vec![
        ("api_key", api_key.to_string()),
        ("start_date", format_date(window.start)),
        ("end_date", format_date(window.end)),
        ("thumbs", "true".to_string()),
    ]
}

pub fn parse_apod_items(response: JsonValue) -> Result<Vec<ApodEntry>, SourceError> {
    match response {
        JsonValue::Array(items) => items.into_iter().map(ApodEntry::from_value).collect(),
        // a single-date query answers with one object
        JsonValue::Object(map) => Ok(vec![ApodEntry::from_value(JsonValue::Object(map))?]),
        other => Err(SourceError::malformed(
            APOD_KEY,
            format!("expected a list of items, got {other}"),
        )),
    }
}

pub async fn fetch_apod(
    http: &HttpFetcher,
    endpoints: &Endpoints,
    api_key: &str,
    window: &DateWindow,
) -> Result<Vec<ApodEntry>, SourceError> {
    let response = http
        .get_json(&endpoints.apod, &apod_query(api_key, window), RequestKind::Metadata)
        .await?;
    parse_apod_items(response)
}

// ----- Mars rovers -----

pub fn rover_key(rover: &str) -> String {
    format!("mars_{}", rover.to_ascii_lowercase())
}

/// How to pick the photo set. Sol and Earth date cannot both be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoverSelector {
    Sol(u32),
    EarthDate(NaiveDate),
    #[default]
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSelector {
    Sol(u32),
    EarthDate(NaiveDate),
}

impl ResolvedSelector {
    /// Output directory name: `sol_<n>` or `YYYYMMDD`.
    pub fn dir_name(&self) -> String {
        match self {
            Self::Sol(sol) => format!("sol_{sol}"),
            Self::EarthDate(date) => date.format("%Y%m%d").to_string(),
        }
    }

    fn query_pair(&self) -> (&'static str, String) {
        match self {
            Self::Sol(sol) => ("sol", sol.to_string()),
            Self::EarthDate(date) => ("earth_date", format_date(*date)),
        }
    }
}

/// Sols used when the manifest cannot be fetched. Stale by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSols {
    pub sols: BTreeMap<String, u32>,
    pub default_sol: u32,
}

impl Default for FallbackSols {
    fn default() -> Self {
        let sols = [
            ("curiosity", 4100),
            ("perseverance", 1000),
            ("opportunity", 5111),
            ("spirit", 2208),
        ]
        .into_iter()
        .map(|(rover, sol)| (rover.to_string(), sol))
        .collect();
        Self {
            sols,
            default_sol: 1000,
        }
    }
}

impl FallbackSols {
    pub fn sol_for(&self, rover: &str) -> u32 {
        self.sols
            .get(&rover.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_sol)
    }
}

pub fn rover_dir(rover: &str, selector: &ResolvedSelector) -> PathBuf {
    PathBuf::from("mars")
        .join(path_segment(&rover.to_ascii_lowercase()))
        .join(selector.dir_name())
}

#[derive(Debug, Deserialize)]
struct ManifestResponse {
    photo_manifest: PhotoManifest,
}

#[derive(Debug, Deserialize)]
struct PhotoManifest {
    max_sol: u32,
}

pub async fn fetch_max_sol(
    http: &HttpFetcher,
    endpoints: &Endpoints,
    api_key: &str,
    rover: &str,
) -> Result<u32, SourceError> {
    let url = format!(
        "{}/manifests/{}",
        endpoints.mars_photos.trim_end_matches('/'),
        rover.to_ascii_lowercase()
    );
    let response = http
        .get_json(&url, &[("api_key", api_key.to_string())], RequestKind::Metadata)
        .await?;
    let manifest: ManifestResponse = decode(&rover_key(rover), response)?;
    Ok(manifest.photo_manifest.max_sol)
}

#[derive(Debug, Clone, Deserialize)]
struct PhotoFields {
    id: u64,
    sol: u32,
    earth_date: NaiveDate,
    img_src: String,
    camera: CameraFields,
}

#[derive(Debug, Clone, Deserialize)]
struct CameraFields {
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoverPhoto {
    pub id: u64,
    pub sol: u32,
    pub earth_date: NaiveDate,
    pub camera: String,
    pub img_src: String,
    pub raw: JsonValue,
}

impl RoverPhoto {
    pub fn from_value(source_key: &str, raw: JsonValue) -> Result<Self, SourceError> {
        let fields: PhotoFields = decode(source_key, raw.clone())?;
        Ok(Self {
            id: fields.id,
            sol: fields.sol,
            earth_date: fields.earth_date,
            camera: fields.camera.name,
            img_src: fields.img_src,
            raw,
        })
    }

    pub fn file_name(&self) -> String {
        url_file_name(&self.img_src)
            .map(path_segment)
            .unwrap_or_else(|| format!("{}.{}", self.id, url_extension(&self.img_src)))
    }

    pub fn metadata_file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    pub fn summary(&self) -> RoverPhotoSummary {
        RoverPhotoSummary {
            id: self.id,
            camera: self.camera.clone(),
            sol: self.sol,
            earth_date: self.earth_date,
        }
    }
}

pub fn rover_photos_query(
    api_key: &str,
    selector: &ResolvedSelector,
    camera: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("api_key", api_key.to_string()), selector.query_pair()];
    if let Some(camera) = camera {
        query.push(("camera", camera.to_string()));
    }
    query
}

pub fn parse_rover_photos(
    rover: &str,
    response: JsonValue,
    limit: usize,
) -> Result<Vec<RoverPhoto>, SourceError> {
    let source_key = rover_key(rover);
    let photos = match response {
        JsonValue::Object(mut map) => map.remove("photos"),
        _ => None,
    };
    let Some(JsonValue::Array(photos)) = photos else {
        return Err(SourceError::malformed(&source_key, "missing `photos` list"));
    };
    photos
        .into_iter()
        .take(limit)
        .map(|raw| RoverPhoto::from_value(&source_key, raw))
        .collect()
}

pub async fn fetch_rover_photos(
    http: &HttpFetcher,
    endpoints: &Endpoints,
    api_key: &str,
    rover: &str,
    selector: &ResolvedSelector,
    camera: Option<&str>,
    limit: usize,
) -> Result<Vec<RoverPhoto>, SourceError> {
    let url = format!(
        "{}/rovers/{}/photos",
        endpoints.mars_photos.trim_end_matches('/'),
        rover.to_ascii_lowercase()
    );
    let response = http
        .get_json(
            &url,
            &rover_photos_query(api_key, selector, camera),
            RequestKind::Metadata,
        )
        .await?;
    parse_rover_photos(rover, response, limit)
}

// ----- Near Earth Objects -----

/// `neo/weekly/<YYYY>-W<WW>.json`, Monday-based week of `end`.
pub fn neo_week_file(end: NaiveDate) -> PathBuf {
    PathBuf::from(NEO_KEY)
        .join("weekly")
        .join(format!("{}.json", end.format("%Y-W%W")))
}

pub fn neo_query(api_key: &str, window: &DateWindow) -> Vec<(&'static str, String)> {
    vec![
        ("start_date", format_date(window.start)),
        ("end_date", format_date(window.end)),
        ("api_key", api_key.to_string()),
    ]
}

pub async fn fetch_neo_feed(
    http: &HttpFetcher,
    endpoints: &Endpoints,
    api_key: &str,
    window: &DateWindow,
) -> Result<JsonValue, SourceError> {
    Ok(http
        .get_json(&endpoints.neo_feed, &neo_query(api_key, window), RequestKind::Metadata)
        .await?)
}

#[derive(Debug, Deserialize)]
struct NeoObject {
    name: String,
    #[serde(default)]
    is_potentially_hazardous_asteroid: bool,
    #[serde(default)]
    close_approach_data: Vec<NeoApproach>,
}

#[derive(Debug, Deserialize)]
struct NeoApproach {
    close_approach_date: String,
    miss_distance: MissDistance,
}

#[derive(Debug, Deserialize)]
struct MissDistance {
    kilometers: NumberOrString,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Hazard count and the single closest approach across every object's
/// approach records. Walks date groups in the order served; the first record
/// at the minimum distance is kept.
pub fn summarize_neo_feed(feed: &JsonValue) -> Result<NeoStats, SourceError> {
    let total_count = feed
        .get("element_count")
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| SourceError::malformed(NEO_KEY, "missing `element_count`"))?;
    let groups = feed
        .get("near_earth_objects")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| SourceError::malformed(NEO_KEY, "missing `near_earth_objects`"))?;

    let mut potentially_hazardous = 0u64;
    let mut closest: Option<ClosestApproach> = None;

    for (date, objects) in groups {
        let objects: Vec<NeoObject> = serde_json::from_value(objects.clone())
            .map_err(|err| SourceError::malformed(NEO_KEY, format!("group {date}: {err}")))?;
        for object in objects {
            if object.is_potentially_hazardous_asteroid {
                potentially_hazardous += 1;
            }
            for approach in &object.close_approach_data {
                let distance = approach.miss_distance.kilometers.as_f64().ok_or_else(|| {
                    SourceError::malformed(
                        NEO_KEY,
                        format!("unparsable miss distance for {}", object.name),
                    )
                })?;
                let closer = closest
                    .as_ref()
                    .map_or(true, |best| distance < best.distance_km);
                if closer {
                    closest = Some(ClosestApproach {
                        name: object.name.clone(),
                        distance_km: distance,
                        date: approach.close_approach_date.clone(),
                    });
                }
            }
        }
    }

    Ok(NeoStats {
        total_count,
        potentially_hazardous,
        closest_approach: closest,
    })
}

// ----- POWER daily point data -----

pub fn power_key(location_name: &str) -> String {
    format!("power_{location_name}")
}

/// `25.0` stays `25.0` so integer coordinates keep their decimal point.
pub fn default_location_name(lat: f64, lon: f64) -> String {
    format!("{lat:?}_{lon:?}")
}

pub fn power_output_file(location_name: &str, start: NaiveDate, end: NaiveDate) -> PathBuf {
    PathBuf::from("power")
        .join(path_segment(location_name))
        .join(format!("{}_{}.json", format_date(start), format_date(end)))
}

pub fn power_query(
    lat: f64,
    lon: f64,
    start: NaiveDate,
    end: NaiveDate,
    parameters: &[String],
) -> Vec<(&'static str, String)> {
    vec![
        ("start", start.format("%Y%m%d").to_string()),
        ("end", end.format("%Y%m%d").to_string()),
        ("latitude", lat.to_string()),
        ("longitude", lon.to_string()),
        ("community", "RE".to_string()),
        ("parameters", parameters.join(",")),
        ("format", "JSON".to_string()),
    ]
}

/// Single-page request; POWER answers the whole range at once.
pub async fn fetch_power_daily(
    http: &HttpFetcher,
    endpoints: &Endpoints,
    lat: f64,
    lon: f64,
    start: NaiveDate,
    end: NaiveDate,
    parameters: &[String],
) -> Result<JsonValue, SourceError> {
    Ok(http
        .get_json(
            &endpoints.power_daily_point,
            &power_query(lat, lon, start, end, parameters),
            RequestKind::Download,
        )
        .await?)
}

/// Daily values of one parameter, keyed by `YYYYMMDD`.
pub fn power_parameter_series<'a>(
    response: &'a JsonValue,
    parameter: &str,
) -> Option<&'a serde_json::Map<String, JsonValue>> {
    response
        .get("properties")?
        .get("parameter")?
        .get(parameter)?
        .as_object()
}
