//! End-to-end harvests against a local stub of the NASA endpoints.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use nasa_core::{Catalog, SourceDetail};
use nasa_harvest::{
    check_credentials, HarvestConfig, HarvestError, Harvester, PowerRequest, ProbeOutcome,
    RoverRequest, SelectorSource,
};
use nasa_sources::{Endpoints, RoverSelector};
use nasa_storage::{CatalogStore, FetchError, FileCatalogStore, MemoryCatalogStore};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::net::TcpListener;

const IMAGE_BYTES: &[u8] = b"\xFF\xD8\xFFstub-jpeg";

#[derive(Debug, Clone, Copy, Default)]
struct StubOptions {
    fail_apod: bool,
    fail_manifest: bool,
}

#[derive(Clone)]
struct StubState {
    base: String,
    options: StubOptions,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    photo_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl StubState {
    fn hit(&self, key: impl Into<String>) {
        *self.hits.lock().unwrap().entry(key.into()).or_default() += 1;
    }
}

struct Stub {
    state: StubState,
}

impl Stub {
    async fn start(options: StubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let base = format!("http://{}", listener.local_addr().expect("stub addr"));
        let state = StubState {
            base,
            options,
            hits: Arc::default(),
            photo_queries: Arc::default(),
        };
        let app = Router::new()
            .route("/planetary/apod", get(apod_handler))
            .route("/images/{name}", get(image_handler))
            .route("/mars-photos/api/v1/manifests/{rover}", get(manifest_handler))
            .route("/mars-photos/api/v1/rovers/{rover}/photos", get(photos_handler))
            .route("/neo/rest/v1/feed", get(neo_handler))
            .route("/api/temporal/daily/point", get(power_handler))
            .route("/search/collections.json", get(cmr_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });
        Self { state }
    }

    fn hits(&self, key: &str) -> usize {
        self.state.hits.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn last_photo_query(&self) -> HashMap<String, String> {
        self.state
            .photo_queries
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("photos endpoint was called")
    }

    fn config(&self, data_dir: &Path) -> HarvestConfig {
        let mut config = HarvestConfig::from_vars(|_| None);
        config.data_dir = data_dir.to_path_buf();
        config.api_key = "TEST_KEY".to_string();
        config.endpoints = Endpoints::with_base(&self.state.base);
        config.metadata_timeout_secs = 5;
        config.download_timeout_secs = 5;
        config
    }
}

async fn apod_handler(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.hit("apod");
    if state.options.fail_apod {
        return (StatusCode::INTERNAL_SERVER_ERROR, "apod down").into_response();
    }
    assert_eq!(query.get("api_key").map(String::as_str), Some("TEST_KEY"));
    assert_eq!(query.get("thumbs").map(String::as_str), Some("true"));
    Json(json!([{
        "date": "2024-06-01",
        "title": "Stub Galaxy",
        "explanation": "A galaxy served by a test.",
        "media_type": "image",
        "url": format!("{}/images/2024-06-01_small.jpg", state.base),
        "hdurl": format!("{}/images/2024-06-01_hd.jpg?download=1", state.base)
    }]))
    .into_response()
}

async fn image_handler(State(state): State<StubState>, AxumPath(name): AxumPath<String>) -> Response {
    state.hit(format!("image:{name}"));
    if name.starts_with("missing") {
        return (StatusCode::NOT_FOUND, "no such image").into_response();
    }
    ([(header::CONTENT_TYPE, "image/jpeg")], IMAGE_BYTES).into_response()
}

async fn manifest_handler(State(state): State<StubState>, AxumPath(rover): AxumPath<String>) -> Response {
    state.hit(format!("manifest:{rover}"));
    if state.options.fail_manifest {
        return (StatusCode::SERVICE_UNAVAILABLE, "manifest unavailable").into_response();
    }
    Json(json!({"photo_manifest": {"name": rover, "max_sol": 4200}})).into_response()
}

async fn photos_handler(
    State(state): State<StubState>,
    AxumPath(rover): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.hit(format!("photos:{rover}"));
    state.photo_queries.lock().unwrap().push(query.clone());
    let sol: u32 = query.get("sol").and_then(|s| s.parse().ok()).unwrap_or(0);
    let photo = |id: u64, file: &str| {
        json!({
            "id": id,
            "sol": sol,
            "earth_date": "2024-02-19",
            "img_src": format!("{}/images/{file}", state.base),
            "camera": {"id": 20, "name": "FHAZ", "full_name": "Front Hazard Avoidance Camera"},
            "rover": {"name": rover}
        })
    };
    Json(json!({
        "photos": [
            photo(101, "frame_101.JPG"),
            photo(102, "missing_102.JPG"),
            photo(103, "frame_103.JPG")
        ]
    }))
    .into_response()
}

fn neo_object(name: &str, hazardous: bool, km: &str, date: &str) -> Value {
    json!({
        "id": name,
        "name": name,
        "is_potentially_hazardous_asteroid": hazardous,
        "close_approach_data": [{
            "close_approach_date": date,
            "miss_distance": {"kilometers": km, "lunar": "1.0"}
        }]
    })
}

async fn neo_handler(State(state): State<StubState>) -> Response {
    state.hit("neo");
    Json(json!({
        "element_count": 3,
        "near_earth_objects": {
            "2024-06-02": [
                neo_object("(2024 FIRST)", false, "1000.25", "2024-06-02"),
                neo_object("(2024 FAR)", true, "8000000.0", "2024-06-02")
            ],
            "2024-06-01": [
                neo_object("(2024 TIED)", true, "1000.25", "2024-06-01")
            ]
        }
    }))
    .into_response()
}

async fn power_handler(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.hit("power");
    let parameters = query.get("parameters").cloned().unwrap_or_default();
    let mut series = serde_json::Map::new();
    for parameter in parameters.split(',').filter(|p| !p.is_empty()) {
        series.insert(
            parameter.to_string(),
            json!({"20250101": 21.3, "20250102": 20.9, "20250103": 22.0}),
        );
    }
    Json(json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [query.get("longitude"), query.get("latitude")]},
        "properties": {"parameter": series}
    }))
    .into_response()
}

async fn cmr_handler(State(state): State<StubState>, headers: HeaderMap) -> Response {
    state.hit("cmr");
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer good-token");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    Json(json!({"feed": {"entry": [{"short_name": "MCD43A4"}]}})).into_response()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).and_then(|m| m.modified()).expect("mtime")
}

#[tokio::test]
async fn apod_single_day_writes_metadata_image_and_catalog_entry() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let report = harvester.harvest_apod(1).await.expect("apod harvest");

    assert_eq!(report.items.len(), 1);
    assert_eq!(report.items[0].title, "Stub Galaxy");
    assert_eq!(report.downloads.stored(), 1);
    let meta = dir.path().join("apod/2024/06/2024-06-01.json");
    let image = dir.path().join("apod/2024/06/2024-06-01.jpg");
    assert!(meta.exists());
    assert_eq!(std::fs::read(&image).unwrap(), IMAGE_BYTES);
    assert_eq!(stub.hits("image:2024-06-01_hd.jpg"), 1);
    assert_eq!(stub.hits("image:2024-06-01_small.jpg"), 0);

    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&meta).unwrap()).unwrap();
    assert_eq!(saved["explanation"], "A galaxy served by a test.");

    let catalog = FileCatalogStore::in_dir(dir.path()).load().await.unwrap();
    match &catalog.source("apod").expect("apod entry").detail {
        SourceDetail::Apod {
            items_harvested,
            date_range,
        } => {
            assert_eq!(*items_harvested, 1);
            assert_eq!(*date_range.last().unwrap() - *date_range.first().unwrap(), chrono::Duration::days(1));
        }
        other => panic!("unexpected apod entry {other:?}"),
    }
    assert_eq!(catalog.total_files, 2);
}

#[tokio::test]
async fn repeated_harvest_leaves_cached_files_untouched() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    harvester.harvest_apod(1).await.expect("first run");
    let meta = dir.path().join("apod/2024/06/2024-06-01.json");
    let image = dir.path().join("apod/2024/06/2024-06-01.jpg");
    let (meta_before, image_before) = (mtime(&meta), mtime(&image));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = harvester.harvest_apod(1).await.expect("second run");

    assert_eq!(second.downloads.cached(), 1);
    assert_eq!(second.downloads.stored(), 0);
    assert_eq!(stub.hits("apod"), 2);
    assert_eq!(stub.hits("image:2024-06-01_hd.jpg"), 1);
    assert_eq!(mtime(&meta), meta_before);
    assert_eq!(mtime(&image), image_before);
    assert_eq!(std::fs::read(&image).unwrap(), IMAGE_BYTES);
}

#[tokio::test]
async fn failed_photo_download_is_skipped_and_batch_continues() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let report = harvester
        .harvest_mars_rover(RoverRequest {
            rover: "curiosity".into(),
            selector: RoverSelector::Sol(4000),
            camera: Some("FHAZ".into()),
            limit: 25,
        })
        .await
        .expect("rover harvest");

    assert_eq!(report.resolution, SelectorSource::Requested);
    assert_eq!(report.photos.len(), 3);
    assert_eq!(report.downloads.stored(), 2);
    assert_eq!(report.downloads.skipped(), 1);
    assert_eq!(stub.hits("manifest:curiosity"), 0);

    let query = stub.last_photo_query();
    assert_eq!(query.get("sol").map(String::as_str), Some("4000"));
    assert_eq!(query.get("camera").map(String::as_str), Some("FHAZ"));
    assert!(!query.contains_key("earth_date"));

    let out = dir.path().join("mars/curiosity/sol_4000");
    assert!(out.join("frame_101.JPG").exists());
    assert!(!out.join("missing_102.JPG").exists());
    for id in [101, 102, 103] {
        assert!(out.join(format!("{id}.json")).exists(), "sidecar {id}");
    }

    match &harvester.catalog().source("mars_curiosity").unwrap().detail {
        SourceDetail::Rover { items_harvested, selector } => {
            assert_eq!(*items_harvested, 3);
            assert_eq!(selector.as_deref(), Some("sol_4000"));
        }
        other => panic!("unexpected rover entry {other:?}"),
    }
}

#[tokio::test]
async fn manifest_failure_falls_back_to_configured_sol() {
    let stub = Stub::start(StubOptions {
        fail_manifest: true,
        ..Default::default()
    })
    .await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let report = harvester
        .harvest_mars_rover(RoverRequest::latest("curiosity", 1))
        .await
        .expect("rover harvest");
    assert_eq!(report.resolution, SelectorSource::Fallback);
    assert_eq!(report.selector, "sol_4100");
    assert_eq!(report.photos.len(), 1);
    assert!(dir.path().join("mars/curiosity/sol_4100/101.json").exists());
    assert_eq!(stub.last_photo_query().get("sol").map(String::as_str), Some("4100"));

    for (rover, expected) in [
        ("perseverance", "sol_1000"),
        ("opportunity", "sol_5111"),
        ("spirit", "sol_2208"),
        ("zhurong", "sol_1000"),
    ] {
        let report = harvester
            .harvest_mars_rover(RoverRequest::latest(rover, 1))
            .await
            .expect("rover harvest");
        assert_eq!(report.selector, expected, "{rover}");
        assert!(dir.path().join("mars").join(rover).join(expected).is_dir());
    }
}

#[tokio::test]
async fn manifest_max_sol_and_earth_date_pick_the_output_dir() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let latest = harvester
        .harvest_mars_rover(RoverRequest::latest("curiosity", 1))
        .await
        .expect("latest");
    assert_eq!(latest.resolution, SelectorSource::Manifest);
    assert_eq!(latest.output_dir, Path::new("mars/curiosity/sol_4200"));

    let dated = harvester
        .harvest_mars_rover(RoverRequest {
            rover: "curiosity".into(),
            selector: RoverSelector::EarthDate(date("2024-02-19")),
            camera: None,
            limit: 1,
        })
        .await
        .expect("earth date");
    assert_eq!(dated.output_dir, Path::new("mars/curiosity/20240219"));
    let query = stub.last_photo_query();
    assert_eq!(query.get("earth_date").map(String::as_str), Some("2024-02-19"));
    assert!(!query.contains_key("sol"));
}

#[tokio::test]
async fn neo_closest_approach_keeps_first_of_tied_objects() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let report = harvester.harvest_neo(7).await.expect("neo harvest");

    assert_eq!(report.stats.total_count, 3);
    assert_eq!(report.stats.potentially_hazardous, 2);
    let closest = report.stats.closest_approach.clone().expect("closest");
    assert_eq!(closest.name, "(2024 FIRST)");
    assert_eq!(closest.distance_km, 1000.25);
    assert_eq!(closest.date, "2024-06-02");

    assert!(report.output.starts_with("neo/weekly"));
    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(&report.output)).unwrap())
            .unwrap();
    assert_eq!(raw["element_count"], 3);
}

#[tokio::test]
async fn catalog_reload_matches_and_last_updated_advances() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");
    assert_eq!(harvester.catalog().last_updated, None);

    harvester.harvest_neo(7).await.expect("first");
    let first = harvester.catalog().last_updated.expect("stamped");
    tokio::time::sleep(Duration::from_millis(10)).await;
    harvester.harvest_neo(7).await.expect("second");

    let reloaded = FileCatalogStore::in_dir(dir.path()).load().await.unwrap();
    assert_eq!(reloaded.source("neo"), harvester.catalog().source("neo"));
    assert!(reloaded.last_updated.expect("stamped") > first);

    let reopened = Harvester::open(stub.config(dir.path())).await.expect("reopen");
    assert_eq!(reopened.catalog(), harvester.catalog());
}

#[tokio::test]
async fn harvest_all_records_failure_and_keeps_going() {
    let stub = Stub::start(StubOptions {
        fail_apod: true,
        ..Default::default()
    })
    .await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let results = harvester.harvest_all().await;

    let apod_error = results["apod"].error().expect("apod failed");
    assert!(apod_error.contains("500"), "{apod_error}");
    assert!(results["mars"].error().is_none());
    assert!(results["neo"].error().is_none());
    assert_eq!(stub.hits("neo"), 1);
    assert_eq!(stub.hits("photos:curiosity"), 1);

    let catalog = harvester.catalog();
    assert!(catalog.source("apod").is_none());
    assert!(catalog.source("mars_curiosity").is_some());
    assert!(catalog.source("neo").is_some());

    let rendered = serde_json::to_value(&results).unwrap();
    assert_eq!(rendered["apod"]["error"], json!(apod_error));
}

#[tokio::test]
async fn call_level_http_errors_propagate_to_the_caller() {
    let stub = Stub::start(StubOptions {
        fail_apod: true,
        ..Default::default()
    })
    .await;
    let dir = tempdir().expect("tempdir");
    let store = MemoryCatalogStore::new();
    let mut harvester = Harvester::with_store(stub.config(dir.path()), store.clone())
        .await
        .expect("harvester");

    let err = harvester.harvest_apod(7).await.expect_err("apod is down");
    assert!(matches!(
        err,
        HarvestError::Fetch(FetchError::HttpStatus { status: 500, .. })
    ));
    assert!(!err.to_string().contains("TEST_KEY"));
    assert_eq!(store.save_count().await, 0);
}

#[tokio::test]
async fn power_harvest_uses_memory_store_and_default_location() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let store = MemoryCatalogStore::new();
    let mut harvester = Harvester::with_store(stub.config(dir.path()), store.clone())
        .await
        .expect("harvester");

    let report = harvester
        .harvest_power_climate(PowerRequest {
            lat: 25.2,
            lon: 55.27,
            start: date("2025-01-01"),
            end: date("2025-01-03"),
            location_name: None,
        })
        .await
        .expect("power harvest");

    assert_eq!(report.location_name, "25.2_55.27");
    assert!(dir
        .path()
        .join("power/25.2_55.27/2025-01-01_2025-01-03.json")
        .exists());
    assert!(report.response["properties"]["parameter"]["RH2M"].is_object());
    assert!(!dir.path().join("catalog.json").exists());

    assert_eq!(store.save_count().await, 1);
    let saved = store.snapshot().await.expect("saved catalog");
    match &saved.source("power_25.2_55.27").expect("power entry").detail {
        SourceDetail::Power { location, temporal } => {
            assert_eq!((location.lat, location.lon), (25.2, 55.27));
            assert_eq!(*temporal, [date("2025-01-01"), date("2025-01-03")]);
        }
        other => panic!("unexpected power entry {other:?}"),
    }

    let err = harvester
        .harvest_power_climate(PowerRequest {
            lat: 0.0,
            lon: 0.0,
            start: date("2025-02-01"),
            end: date("2025-01-01"),
            location_name: Some("backwards".into()),
        })
        .await
        .expect_err("reversed range");
    assert!(matches!(err, HarvestError::InvalidRequest(_)));
}

#[tokio::test]
async fn credential_probes_report_each_service() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");

    let mut config = stub.config(dir.path());
    let harvester = Harvester::with_store(config.clone(), MemoryCatalogStore::new())
        .await
        .expect("harvester");

    let report = check_credentials(harvester.http(), &config).await;
    assert_eq!(report.earthdata, ProbeOutcome::NotConfigured);
    assert_eq!(
        report.power,
        ProbeOutcome::Ok {
            detail: "3 daily T2M values".into()
        }
    );

    config.earthdata_token = Some("good-token".into());
    let report = check_credentials(harvester.http(), &config).await;
    assert!(matches!(report.earthdata, ProbeOutcome::Ok { .. }));

    config.earthdata_token = Some("stale-token".into());
    let report = check_credentials(harvester.http(), &config).await;
    match report.earthdata {
        ProbeOutcome::Failed { error } => assert!(error.contains("401"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_rover_harvest_reuses_cached_photos() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");
    let request = RoverRequest {
        rover: "curiosity".into(),
        selector: RoverSelector::Sol(4000),
        camera: None,
        limit: 25,
    };

    harvester.harvest_mars_rover(request.clone()).await.expect("first run");
    let out = dir.path().join("mars/curiosity/sol_4000");
    let cached = ["frame_101.JPG", "frame_103.JPG", "101.json", "102.json", "103.json"];
    let before: Vec<_> = cached.iter().map(|name| mtime(&out.join(name))).collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = harvester.harvest_mars_rover(request).await.expect("second run");

    assert_eq!(second.downloads.cached(), 2);
    assert_eq!(second.downloads.stored(), 0);
    assert_eq!(second.downloads.skipped(), 1);
    assert_eq!(stub.hits("photos:curiosity"), 2);
    assert_eq!(stub.hits("image:frame_101.JPG"), 1);
    assert_eq!(stub.hits("image:frame_103.JPG"), 1);
    let after: Vec<_> = cached.iter().map(|name| mtime(&out.join(name))).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn repeated_neo_harvest_leaves_weekly_file_untouched() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::open(stub.config(dir.path())).await.expect("harvester");

    let first = harvester.harvest_neo(7).await.expect("first run");
    let weekly = dir.path().join(&first.output);
    let before = mtime(&weekly);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = harvester.harvest_neo(7).await.expect("second run");

    assert_eq!(second.output, first.output);
    assert_eq!(stub.hits("neo"), 2);
    assert_eq!(mtime(&weekly), before);
}

/// Loads an empty catalog and refuses every save.
struct ReadOnlyCatalogStore;

#[async_trait]
impl CatalogStore for ReadOnlyCatalogStore {
    async fn load(&self) -> anyhow::Result<Catalog> {
        Ok(Catalog::default())
    }

    async fn save(&self, _catalog: &Catalog) -> anyhow::Result<()> {
        anyhow::bail!("catalog store is read-only")
    }
}

#[tokio::test]
async fn failed_catalog_save_keeps_previous_catalog_in_memory() {
    let stub = Stub::start(StubOptions::default()).await;
    let dir = tempdir().expect("tempdir");
    let mut harvester = Harvester::with_store(stub.config(dir.path()), ReadOnlyCatalogStore)
        .await
        .expect("harvester");

    let err = harvester.harvest_neo(7).await.expect_err("save fails");

    assert!(matches!(err, HarvestError::Storage(_)));
    assert!(err.to_string().contains("read-only"), "{err}");
    assert_eq!(harvester.catalog(), &Catalog::default());
}
