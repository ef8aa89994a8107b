use roar_core::{DriverPreferences, Offer};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterReason {
    FareBelowMinimum { fare_minor: u64, min_fare_minor: u64 },
    TripTooLong { distance_km: f64, max_distance_km: f64 },
    ExcludedArea { area: String },
    OutsidePreferredAreas,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredOffer {
    pub offer_id: String,
    pub source_id: String,
    pub reason: FilterReason,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterOutcome {
    pub kept: Vec<Offer>,
    pub dropped: Vec<FilteredOffer>,
}

/// First preference the offer violates, if any. An unset preference never excludes.
pub fn rejection_reason(offer: &Offer, prefs: &DriverPreferences) -> Option<FilterReason> {
    if let Some(min_fare_minor) = prefs.min_fare_minor {
        if offer.fare_minor < min_fare_minor {
            return Some(FilterReason::FareBelowMinimum {
                fare_minor: offer.fare_minor,
                min_fare_minor,
            });
        }
    }
    if let Some(max_distance_km) = prefs.max_distance_km {
        if offer.distance_km > max_distance_km {
            return Some(FilterReason::TripTooLong {
                distance_km: offer.distance_km,
                max_distance_km,
            });
        }
    }
    let pickup = offer.pickup.point;
    if let Some(area) = prefs.excluded_areas.iter().find(|a| a.contains(pickup)) {
        return Some(FilterReason::ExcludedArea {
            area: area.name().to_string(),
        });
    }
    if !prefs.preferred_areas.is_empty() && !prefs.preferred_areas.iter().any(|a| a.contains(pickup)) {
        return Some(FilterReason::OutsidePreferredAreas);
    }
    None
}

/// Keeps offers that satisfy every preference, in input order.
pub fn filter_offers(offers: Vec<Offer>, prefs: &DriverPreferences) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for offer in offers {
        match rejection_reason(&offer, prefs) {
            None => outcome.kept.push(offer),
            Some(reason) => {
                debug!(offer_id = %offer.id, source_id = %offer.source_id, ?reason, "offer filtered");
                outcome.dropped.push(FilteredOffer {
                    offer_id: offer.id,
                    source_id: offer.source_id,
                    reason,
                });
            }
        }
    }
    outcome
}
