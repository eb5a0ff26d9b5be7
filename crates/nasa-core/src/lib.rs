//! Catalog model and per-source harvest summaries for the NASA harvester.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nasa-core";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// The single JSON document summarizing the latest harvest per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceRecord>,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub total_size_mb: f64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            last_updated: None,
            sources: BTreeMap::new(),
            total_files: 0,
            total_size_mb: 0.0,
        }
    }
}

impl Catalog {
    pub fn source(&self, key: &str) -> Option<&SourceRecord> {
        self.sources.get(key)
    }

    /// Replaces the entry for `key`; the previous harvest summary is not kept.
    pub fn record(&mut self, key: impl Into<String>, record: SourceRecord) {
        self.sources.insert(key.into(), record);
    }

    pub fn set_totals(&mut self, file_count: u64, total_bytes: u64) {
        self.total_files = file_count;
        self.total_size_mb = (total_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0;
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = Some(at);
    }
}

/// Summary of the most recent harvest of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub last_harvest: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: SourceDetail,
}

impl SourceRecord {
    pub fn new(last_harvest: DateTime<Utc>, detail: SourceDetail) -> Self {
        Self {
            last_harvest,
            detail,
        }
    }
}

/// Timestamps are written as RFC 3339. Older catalogs carry offset-less
/// ISO 8601 local times (`2024-06-01T12:00:00.123456`); those load as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                text.parse::<NaiveDateTime>()
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{text}`")))
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(text) => parse(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{text}`"))),
        }
    }
}

/// Source-specific catalog fields.
///
/// Untagged on the wire so catalog files keep the flat shape
/// `{"last_harvest": .., "items_harvested": .., "date_range": [..]}`.
/// Variant order matters for deserialization: `Rover` only requires
/// `items_harvested` and must stay last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceDetail {
    Apod {
        items_harvested: usize,
        date_range: [NaiveDate; 2],
    },
    Neo {
        stats: NeoStats,
    },
    Power {
        location: GeoPoint,
        temporal: [NaiveDate; 2],
    },
    Rover {
        items_harvested: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeoStats {
    pub total_count: u64,
    pub potentially_hazardous: u64,
    pub closest_approach: Option<ClosestApproach>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosestApproach {
    pub name: String,
    pub distance_km: f64,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApodSummary {
    pub date: NaiveDate,
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoverPhotoSummary {
    pub id: u64,
    pub camera: String,
    pub sol: u32,
    pub earth_date: NaiveDate,
}

/// What happened to one downloadable item inside a successful call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Stored { path: PathBuf, bytes: usize },
    Cached { path: PathBuf },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub url: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Per-call collection of item outcomes; skipped items never fail the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn push(&mut self, url: impl Into<String>, outcome: ItemOutcome) {
        self.items.push(ItemReport {
            url: url.into(),
            outcome,
        });
    }

    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Stored { .. }))
    }

    pub fn cached(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Cached { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.outcome)).count()
    }
}
