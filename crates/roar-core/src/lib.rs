//! Core domain model for ROAR: offers, driver context, scored output, geo math.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;

pub use config::{
    AggregationConfig, ConfigError, CostSettings, DecisionPolicy, DedupSettings, ScoreWeights,
    ScoringBands, SourceSettings,
};

pub const CRATE_NAME: &str = "roar-core";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Great-circle distance in meters.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_meters(a, b) / 1000.0
}

/// Named geofence used for driver include/exclude areas and recommended zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Area {
    Circle {
        name: String,
        center: GeoPoint,
        radius_m: f64,
    },
    BoundingBox {
        name: String,
        south_west: GeoPoint,
        north_east: GeoPoint,
    },
}

impl Area {
    pub fn name(&self) -> &str {
        match self {
            Area::Circle { name, .. } | Area::BoundingBox { name, .. } => name,
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            Area::Circle { center, radius_m, .. } => haversine_meters(*center, point) <= *radius_m,
            Area::BoundingBox {
                south_west,
                north_east,
                ..
            } => {
                point.lat >= south_west.lat
                    && point.lat <= north_east.lat
                    && point.lng >= south_west.lng
                    && point.lng <= north_east.lng
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    Low,
    Medium,
    High,
}

impl UrgencyTier {
    /// Tier derived from how soon the pickup is requested.
    pub fn from_lead_time(lead: Duration) -> Self {
        if lead <= Duration::minutes(15) {
            UrgencyTier::High
        } else if lead <= Duration::minutes(60) {
            UrgencyTier::Medium
        } else {
            UrgencyTier::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pickup {
    pub point: GeoPoint,
    #[serde(default)]
    pub address: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dropoff {
    pub point: GeoPoint,
    #[serde(default)]
    pub address: String,
}

/// One bookable ride request as surfaced by a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub source_id: String,
    pub pickup: Pickup,
    pub dropoff: Option<Dropoff>,
    /// Estimated fare in minor currency units.
    pub fare_minor: u64,
    pub distance_km: f64,
    pub duration_min: f64,
    pub counterpart_rating: Option<f64>,
    pub special_requests: Option<String>,
    pub urgency: UrgencyTier,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OfferError {
    #[error("offer has an empty id")]
    MissingId,
    #[error("offer {id}: expires_at must be after created_at")]
    ExpiryBeforeCreation { id: String },
    #[error("offer {id}: counterpart rating {rating} outside 1..=5")]
    RatingOutOfRange { id: String, rating: f64 },
    #[error("offer {id}: {field} must be finite and non-negative")]
    InvalidMeasure { id: String, field: &'static str },
    #[error("offer {id}: {which} coordinates out of range")]
    InvalidCoordinates { id: String, which: &'static str },
}

impl Offer {
    pub fn validate(&self) -> Result<(), OfferError> {
        if self.id.trim().is_empty() {
            return Err(OfferError::MissingId);
        }
        if self.expires_at <= self.created_at {
            return Err(OfferError::ExpiryBeforeCreation { id: self.id.clone() });
        }
        if let Some(rating) = self.counterpart_rating {
            if !(1.0..=5.0).contains(&rating) {
                return Err(OfferError::RatingOutOfRange {
                    id: self.id.clone(),
                    rating,
                });
            }
        }
        for (field, value) in [("distance_km", self.distance_km), ("duration_min", self.duration_min)] {
            if !value.is_finite() || value < 0.0 {
                return Err(OfferError::InvalidMeasure {
                    id: self.id.clone(),
                    field,
                });
            }
        }
        if !self.pickup.point.is_valid() {
            return Err(OfferError::InvalidCoordinates {
                id: self.id.clone(),
                which: "pickup",
            });
        }
        if let Some(dropoff) = &self.dropoff {
            if !dropoff.point.is_valid() {
                return Err(OfferError::InvalidCoordinates {
                    id: self.id.clone(),
                    which: "dropoff",
                });
            }
        }
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverPreferences {
    #[serde(default)]
    pub min_fare_minor: Option<u64>,
    #[serde(default)]
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub preferred_areas: Vec<Area>,
    #[serde(default)]
    pub excluded_areas: Vec<Area>,
}

/// Aggregate history; only modulates confidence, never the score.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverStats {
    #[serde(default)]
    pub ride_count: u32,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub acceptance_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverContext {
    pub driver_id: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub preferences: DriverPreferences,
    #[serde(default)]
    pub stats: DriverStats,
    /// Opaque 0-100 signal of current driving conditions.
    #[serde(default)]
    pub behavioral_score: Option<f64>,
    #[serde(default)]
    pub recommended_zones: Vec<Area>,
    #[serde(default)]
    pub main_city: Option<String>,
}

impl DriverContext {
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: driver_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Reject,
    Neutral,
    WaitForBetter,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Accept => "accept",
            Recommendation::Reject => "reject",
            Recommendation::Neutral => "neutral",
            Recommendation::WaitForBetter => "wait_for_better",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub proximity: f64,
    pub fare: f64,
    pub rating: f64,
    pub source: f64,
    pub urgency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOffer {
    pub offer: Offer,
    pub score: u8,
    pub sub_scores: SubScores,
    pub expected_commission_minor: u64,
    pub profitability_score: u8,
    pub recommendation: Recommendation,
    pub acceptance_threshold: f64,
    pub confidence: f64,
    pub rationale: Vec<String>,
}

/// Outcome of one source within one fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceResult {
    Offers { offers: Vec<Offer> },
    Failed { reason: String },
}

impl SourceResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, SourceResult::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub succeeded: bool,
    pub offer_count: usize,
    pub elapsed_ms: u64,
    pub failure_reason: Option<String>,
}
