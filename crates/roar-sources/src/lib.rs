//! Source port contract + fixture, HTTP and in-memory offer sources.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use roar_core::{DriverContext, Dropoff, GeoPoint, Offer, Pickup, UrgencyTier};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod http;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "roar-sources";

/// Offers without an explicit expiry stay actionable this long after creation.
const DEFAULT_OFFER_TTL_MINUTES: i64 = 15;

/// Minor currency units per whole unit when the configuration does not say otherwise.
pub const DEFAULT_MINOR_UNITS_PER_UNIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ExternalPlatform,
    DirectChannel,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One booking source. Implementations own their transport, auth and retry policy.
#[async_trait]
pub trait SourcePort: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch_offers(&self, ctx: &DriverContext) -> Result<Vec<Offer>, SourceError>;
}

impl fmt::Debug for dyn SourcePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourcePort")
            .field("source_id", &self.source_id())
            .field("kind", &self.kind())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: Option<String>,
}

/// Offer shape shared by fixture bundles and HTTP feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOffer {
    #[serde(default)]
    pub id: Option<String>,
    pub pickup: WirePoint,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub dropoff: Option<WirePoint>,
    #[serde(default)]
    pub fare_minor: Option<u64>,
    /// Fare in whole currency units; used when `fare_minor` is absent and scaled by the
    /// source's minor-units factor.
    #[serde(default)]
    pub fare: Option<f64>,
    #[serde(default)]
    pub distance_km: f64,
    #[serde(default)]
    pub duration_min: f64,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub special_requests: Option<String>,
    #[serde(default)]
    pub urgency: Option<UrgencyTier>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireFeed {
    Wrapped { offers: Vec<WireOffer> },
    Bare(Vec<WireOffer>),
}

impl WireFeed {
    fn into_offers(self) -> Vec<WireOffer> {
        match self {
            WireFeed::Wrapped { offers } | WireFeed::Bare(offers) => offers,
        }
    }
}

fn deterministic_offer_id(source_id: &str, wire: &WireOffer) -> String {
    let seed = format!(
        "{}:{:.6}:{:.6}:{}",
        source_id,
        wire.pickup.lat,
        wire.pickup.lng,
        wire.requested_at.to_rfc3339()
    );
    format!("{source_id}-{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()))
}

/// Convert wire offers into domain offers, shifting every timestamp by `shift`.
///
/// `fetched_at` fills in a missing creation time and is the reference point for
/// urgency when the payload carries no tier. A whole-unit `fare` is multiplied by
/// `minor_units_per_unit`.
pub fn decode_wire_offers(
    source_id: &str,
    wire_offers: Vec<WireOffer>,
    fetched_at: DateTime<Utc>,
    shift: Duration,
    minor_units_per_unit: u64,
) -> Result<Vec<Offer>, SourceError> {
    let scale = minor_units_per_unit.max(1) as f64;
    wire_offers
        .into_iter()
        .map(|wire| {
            let id = wire
                .id
                .clone()
                .unwrap_or_else(|| deterministic_offer_id(source_id, &wire));
            let fare_minor = match (wire.fare_minor, wire.fare) {
                (Some(minor), _) => minor,
                (None, Some(units)) if units.is_finite() && units >= 0.0 => (units * scale).round() as u64,
                (None, Some(units)) => {
                    return Err(SourceError::Decode(format!("offer {id}: invalid fare {units}")));
                }
                (None, None) => return Err(SourceError::Decode(format!("offer {id}: missing fare"))),
            };
            let requested_at = wire.requested_at + shift;
            let created_at = wire.created_at.map(|t| t + shift).unwrap_or(fetched_at);
            let expires_at = wire
                .expires_at
                .map(|t| t + shift)
                .unwrap_or(created_at + Duration::minutes(DEFAULT_OFFER_TTL_MINUTES));
            let urgency = wire
                .urgency
                .unwrap_or_else(|| UrgencyTier::from_lead_time(requested_at - fetched_at));

            Ok(Offer {
                id,
                source_id: source_id.to_string(),
                pickup: Pickup {
                    point: GeoPoint::new(wire.pickup.lat, wire.pickup.lng),
                    address: wire.pickup.address.unwrap_or_default(),
                    requested_at,
                },
                dropoff: wire.dropoff.map(|d| Dropoff {
                    point: GeoPoint::new(d.lat, d.lng),
                    address: d.address.unwrap_or_default(),
                }),
                fare_minor,
                distance_km: wire.distance_km,
                duration_min: wire.duration_min,
                counterpart_rating: wire.rating,
                special_requests: wire
                    .special_requests
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                urgency,
                created_at,
                expires_at,
            })
        })
        .collect()
}

pub fn decode_feed(
    source_id: &str,
    body: &[u8],
    fetched_at: DateTime<Utc>,
    minor_units_per_unit: u64,
) -> Result<Vec<Offer>, SourceError> {
    let feed: WireFeed =
        serde_json::from_slice(body).map_err(|e| SourceError::Decode(format!("invalid offer feed JSON: {e}")))?;
    decode_wire_offers(source_id, feed.into_offers(), fetched_at, Duration::zero(), minor_units_per_unit)
}

/// Recorded feed replayed by [`FixtureSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub offers: Vec<WireOffer>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays a fixture bundle as if it had been captured at fetch time.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    kind: SourceKind,
    path: PathBuf,
    minor_units_per_unit: u64,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
            minor_units_per_unit: DEFAULT_MINOR_UNITS_PER_UNIT,
        }
    }

    pub fn with_minor_units_per_unit(mut self, minor_units_per_unit: u64) -> Self {
        self.minor_units_per_unit = minor_units_per_unit;
        self
    }

    /// Decode the bundle relative to `now`: every timestamp moves by `now - captured_at`.
    pub fn replay(&self, bundle: FixtureBundle, now: DateTime<Utc>) -> Result<Vec<Offer>, SourceError> {
        if bundle.source_id != self.source_id {
            return Err(SourceError::Message(format!(
                "bundle source_id={} does not match source_id={}",
                bundle.source_id, self.source_id
            )));
        }
        decode_wire_offers(
            &self.source_id,
            bundle.offers,
            now,
            now - bundle.captured_at,
            self.minor_units_per_unit,
        )
    }
}

#[async_trait]
impl SourcePort for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_offers(&self, _ctx: &DriverContext) -> Result<Vec<Offer>, SourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        let bundle: FixtureBundle = serde_json::from_str(&text)
            .map_err(|e| SourceError::Decode(format!("{}: {e}", self.path.display())))?;
        self.replay(bundle, Utc::now())
    }
}

/// Remote JSON offer feed polled once per cycle.
#[derive(Debug)]
pub struct HttpJsonSource {
    source_id: String,
    kind: SourceKind,
    endpoint: Url,
    http: Arc<HttpFetcher>,
    minor_units_per_unit: u64,
}

impl HttpJsonSource {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, endpoint: &str, http: Arc<HttpFetcher>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
        Ok(Self {
            source_id: source_id.into(),
            kind,
            endpoint,
            http,
            minor_units_per_unit: DEFAULT_MINOR_UNITS_PER_UNIT,
        })
    }

    pub fn with_minor_units_per_unit(mut self, minor_units_per_unit: u64) -> Self {
        self.minor_units_per_unit = minor_units_per_unit;
        self
    }

    pub fn request_url(&self, ctx: &DriverContext) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("driver_id", &ctx.driver_id);
            if let Some(location) = ctx.location {
                query.append_pair("lat", &format!("{:.6}", location.lat));
                query.append_pair("lng", &format!("{:.6}", location.lng));
            }
        }
        url
    }
}

#[async_trait]
impl SourcePort for HttpJsonSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_offers(&self, ctx: &DriverContext) -> Result<Vec<Offer>, SourceError> {
        let response = self.http.get_bytes(&self.source_id, self.request_url(ctx)).await?;
        decode_feed(&self.source_id, &response.body, Utc::now(), self.minor_units_per_unit)
    }
}

/// In-memory source returning a fixed answer; used for demos and tests.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source_id: String,
    kind: SourceKind,
    answer: std::result::Result<Vec<Offer>, String>,
}

impl StaticSource {
    pub fn offers(source_id: impl Into<String>, kind: SourceKind, offers: Vec<Offer>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            answer: Ok(offers),
        }
    }

    pub fn failing(source_id: impl Into<String>, kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            answer: Err(reason.into()),
        }
    }
}

#[async_trait]
impl SourcePort for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_offers(&self, _ctx: &DriverContext) -> Result<Vec<Offer>, SourceError> {
        self.answer.clone().map_err(SourceError::Message)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    pub transport: Transport,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    Fixture { path: PathBuf },
    Http { url: String },
}

fn default_enabled() -> bool {
    true
}

/// Build ports for every enabled registry entry, in registry order.
///
/// `minor_units_per_unit` scales whole-unit wire fares and should match the scorer's setting.
pub fn build_source_ports(
    registry: &SourceRegistry,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
    minor_units_per_unit: u64,
) -> Result<Vec<Arc<dyn SourcePort>>> {
    registry
        .sources
        .iter()
        .filter(|entry| entry.enabled)
        .map(|entry| -> Result<Arc<dyn SourcePort>> {
            match &entry.transport {
                Transport::Fixture { path } => Ok(Arc::new(
                    FixtureSource::new(entry.source_id.clone(), entry.kind, workspace_root.join(path))
                        .with_minor_units_per_unit(minor_units_per_unit),
                )),
                Transport::Http { url } => Ok(Arc::new(
                    HttpJsonSource::new(entry.source_id.clone(), entry.kind, url, http.clone())
                        .with_context(|| format!("building http source {}", entry.source_id))?
                        .with_minor_units_per_unit(minor_units_per_unit),
                )),
            }
        })
        .collect()
}
