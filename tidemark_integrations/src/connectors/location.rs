//! Location history connector.
//!
//! Reads a GeoJSON `FeatureCollection` of points from a bearer-authenticated API,
//! bounded by `from`/`to` query parameters.

use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use tidemark_core::config::LocationConfig;
use tidemark_core::{
    CacheEntry, CacheSettings, CursorMode, Error, LocalCache, Result, SourceAdapter, SyncItem,
};
use tracing::instrument;

pub const LOCATION_TYPE: &str = "Location";
const CACHE_NAME: &str = "location";

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// `[longitude, latitude]`
    coordinates: [f64; 2],
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    timestamp: String,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    poi: Option<String>,
}

impl Feature {
    fn lat(&self) -> f64 {
        self.geometry.coordinates[1]
    }

    fn lon(&self) -> f64 {
        self.geometry.coordinates[0]
    }

    fn id(&self) -> String {
        format!("{}-{}-{}", self.properties.timestamp, self.lat(), self.lon())
    }

    fn timestamp_ms(&self) -> Result<i64> {
        DateTime::parse_from_rfc3339(&self.properties.timestamp)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| {
                Error::parse(
                    format!("location timestamp '{}'", self.properties.timestamp),
                    e,
                )
            })
    }

    fn title(&self) -> String {
        let coords = format!("lat:{}, lon:{}", self.lat(), self.lon());
        let speed = format_speed(self.properties.speed);
        let prefix = [&self.properties.address, &self.properties.poi]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if prefix.is_empty() {
            format!("Location: {coords}{speed}")
        } else {
            format!("{prefix}: {coords}{speed}")
        }
    }

    /// The maps link only encodes the place, so identity comes from `id()`.
    fn to_item(&self, timestamp_ms: i64) -> SyncItem {
        SyncItem::new(LOCATION_TYPE, self.title(), timestamp_ms)
            .with_url(format!(
                "https://www.google.com/maps?q={},{}",
                self.lat(),
                self.lon()
            ))
            .with_key(self.id())
    }
}

/// ` (N.Nkm/h)` from meters per second; empty when unknown or negative.
fn format_speed(speed_mps: Option<f64>) -> String {
    match speed_mps {
        Some(mps) if mps >= 0.0 => format!(" ({:.1}km/h)", mps * 3.6),
        _ => String::new(),
    }
}

fn iso_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct LocationConnector {
    client: Client,
    config: LocationConfig,
    cache: LocalCache,
}

impl LocationConnector {
    pub fn new(config: LocationConfig, cache: &CacheSettings) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            config,
            cache: cache
                .open(CACHE_NAME)
                .with_retention(ChronoDuration::days(1)),
        })
    }

    #[instrument(level = "info", skip(self, cursor), fields(since = ?cursor.map(|c| c.timestamp_iso())))]
    async fn fetch_at(&self, cursor: Option<&SyncItem>, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let from = cursor
            .and_then(SyncItem::timestamp)
            .unwrap_or_else(|| now - ChronoDuration::hours(24));

        let mut query: Vec<(&str, String)> = Vec::with_capacity(4);
        if let Some(device_id) = self.config.location_device_id.as_deref() {
            query.push(("device_id", device_id.to_string()));
        }
        query.push(("format", "geojson".to_string()));
        query.push(("from", iso_millis(from)));
        query.push(("to", iso_millis(now)));

        let resp = self
            .client
            .get(&self.config.location_api_url)
            .bearer_auth(&self.config.location_api_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| http::send_error("Failed to fetch location", e))?;
        let resp = http::check("Failed to fetch location", resp).await?;
        let collection: FeatureCollection = http::json("location geojson", resp).await?;
        tracing::info!(features = collection.features.len(), "location features fetched");

        let seen: HashSet<String> = self.cache.read().await.into_iter().map(|e| e.id).collect();
        let mut items = Vec::new();
        let mut entries = Vec::new();
        for feature in &collection.features {
            let id = feature.id();
            if seen.contains(&id) {
                continue;
            }
            let timestamp_ms = feature.timestamp_ms()?;
            // The API filters by `from` already; boundary points can still slip through.
            if cursor.is_some_and(|c| timestamp_ms <= c.timestamp_ms) {
                continue;
            }
            entries.push(CacheEntry::new(id, timestamp_ms));
            items.push(feature.to_item(timestamp_ms));
        }
        tracing::info!(new = items.len(), "new location features");

        self.cache.merge_at(entries, now).await?;
        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for LocationConnector {
    fn id(&self) -> &'static str {
        "location"
    }

    fn source_type(&self) -> &str {
        LOCATION_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Timeline
    }

    async fn fetch(&self, cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        self.fetch_at(cursor, Utc::now()).await
    }
}
