//! Offer scoring: weighted sub-scores, profitability estimate, and the accept/reject policy.
//!
//! Everything here is a pure function of the offer, the driver context and the
//! configuration. Missing data maps to the configured neutral value instead of an error.

use roar_core::{
    haversine_km, AggregationConfig, CostSettings, DecisionPolicy, DriverContext, DriverStats,
    GeoPoint, Offer, Recommendation, ScoreWeights, ScoredOffer, ScoringBands, SourceSettings,
    SubScores, UrgencyTier,
};

const CONFIDENCE_RIDE_CAP: u32 = 200;

/// Linear ramp between two breakpoints, clamped to the segment ends.
fn ramp(x: f64, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    if x <= x0 {
        y0
    } else if x >= x1 {
        y1
    } else {
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

pub fn proximity_score(driver: Option<GeoPoint>, pickup: GeoPoint, bands: &ScoringBands) -> f64 {
    match driver {
        Some(location) => ramp(
            haversine_km(location, pickup),
            bands.proximity_full_km,
            100.0,
            bands.proximity_zero_km,
            0.0,
        ),
        None => bands.neutral,
    }
}

pub fn fare_units(fare_minor: u64, costs: &CostSettings) -> f64 {
    fare_minor as f64 / costs.minor_units_per_unit.max(1) as f64
}

pub fn fare_score(fare_minor: u64, costs: &CostSettings, bands: &ScoringBands) -> f64 {
    ramp(
        fare_units(fare_minor, costs),
        bands.fare_floor_units,
        bands.fare_floor_score,
        bands.fare_ceiling_units,
        100.0,
    )
}

pub fn rating_score(rating: Option<f64>, bands: &ScoringBands) -> f64 {
    rating.map_or(bands.neutral, |r| clamp_score(r / 5.0 * 100.0))
}

pub fn source_score(settings: Option<&SourceSettings>, bands: &ScoringBands) -> f64 {
    settings.map_or(bands.neutral, |s| s.desirability)
}

pub fn urgency_score(urgency: UrgencyTier, bands: &ScoringBands) -> f64 {
    match urgency {
        UrgencyTier::High => bands.urgency_high,
        UrgencyTier::Medium => bands.urgency_medium,
        UrgencyTier::Low => bands.urgency_low,
    }
}

pub fn sub_scores(offer: &Offer, ctx: &DriverContext, config: &AggregationConfig) -> SubScores {
    let bands = &config.bands;
    SubScores {
        proximity: proximity_score(ctx.location, offer.pickup.point, bands),
        fare: fare_score(offer.fare_minor, &config.costs, bands),
        rating: rating_score(offer.counterpart_rating, bands),
        source: source_score(config.source(&offer.source_id), bands),
        urgency: urgency_score(offer.urgency, bands),
    }
}

pub fn composite_score(sub: &SubScores, weights: &ScoreWeights) -> u8 {
    let raw = weights.proximity * sub.proximity
        + weights.fare * sub.fare
        + weights.rating * sub.rating
        + weights.source * sub.source
        + weights.urgency * sub.urgency;
    clamp_score(raw.round()) as u8
}

pub fn expected_commission(fare_minor: u64, commission_rate: f64) -> u64 {
    (fare_minor as f64 * commission_rate).round().max(0.0) as u64
}

pub fn variable_cost(distance_km: f64, costs: &CostSettings) -> u64 {
    (distance_km * costs.variable_cost_per_km_minor).round().max(0.0) as u64
}

/// Net margin as a percentage of fare, shifted by 50 so break-even lands mid-scale.
pub fn profitability_score(fare_minor: u64, commission_minor: u64, cost_minor: u64) -> u8 {
    if fare_minor == 0 {
        return 0;
    }
    let fare = fare_minor as f64;
    let net = fare - commission_minor as f64 - cost_minor as f64;
    clamp_score((net / fare * 100.0 + 50.0).round()) as u8
}

pub fn acceptance_threshold(behavioral_score: Option<f64>, internal: bool, policy: &DecisionPolicy) -> f64 {
    let mut threshold = policy.base_threshold;
    match behavioral_score {
        Some(b) if b < policy.low_behavior_cutoff => threshold -= policy.low_behavior_delta,
        Some(b) if b > policy.high_behavior_cutoff => threshold += policy.high_behavior_delta,
        _ => {}
    }
    if internal {
        threshold -= policy.internal_channel_delta;
    }
    clamp_score(threshold)
}

/// Profitability cutoffs decide outright; otherwise the score is compared to the threshold.
pub fn decide(score: u8, profitability: u8, threshold: f64, policy: &DecisionPolicy) -> Recommendation {
    let profitability = f64::from(profitability);
    if profitability >= policy.profitability_accept {
        return Recommendation::Accept;
    }
    if profitability <= policy.profitability_reject {
        return Recommendation::Reject;
    }
    let score = f64::from(score);
    if score >= threshold {
        Recommendation::Accept
    } else if score >= threshold - policy.neutral_margin {
        Recommendation::Neutral
    } else {
        Recommendation::WaitForBetter
    }
}

/// Trust in the recommendation from the driver's history; independent of the offer.
pub fn confidence(stats: &DriverStats) -> f64 {
    let experience = f64::from(stats.ride_count.min(CONFIDENCE_RIDE_CAP)) / f64::from(CONFIDENCE_RIDE_CAP);
    let acceptance = stats.acceptance_rate.unwrap_or(0.5).clamp(0.0, 1.0);
    let mut value = 0.5 + 0.3 * experience + 0.2 * acceptance;
    if stats.rating.is_none() {
        value -= 0.1;
    }
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

struct RationaleInput<'a> {
    offer: &'a Offer,
    ctx: &'a DriverContext,
    sub: &'a SubScores,
    internal: bool,
    profitability: u8,
    policy: &'a DecisionPolicy,
}

fn rationale(input: RationaleInput<'_>) -> Vec<String> {
    let RationaleInput {
        offer,
        ctx,
        sub,
        internal,
        profitability,
        policy,
    } = input;
    let mut reasons = Vec::new();

    if ctx.location.is_none() {
        reasons.push("driver location unknown");
    } else if sub.proximity >= 90.0 {
        reasons.push("very close pickup");
    } else if sub.proximity <= 20.0 {
        reasons.push("distant pickup");
    }

    if sub.fare >= 80.0 {
        reasons.push("high fare");
    } else if sub.fare <= 30.0 {
        reasons.push("low fare");
    }

    match offer.counterpart_rating {
        None => reasons.push("no counterpart rating"),
        Some(_) if sub.rating >= 90.0 => reasons.push("highly rated counterpart"),
        Some(_) if sub.rating <= 60.0 => reasons.push("low counterpart rating"),
        Some(_) => {}
    }

    if internal {
        reasons.push("direct booking channel");
    }
    if offer.urgency == UrgencyTier::High {
        reasons.push("urgent pickup");
    }
    if ctx.recommended_zones.iter().any(|z| z.contains(offer.pickup.point)) {
        reasons.push("pickup in recommended zone");
    }

    let profitability = f64::from(profitability);
    if profitability >= policy.profitability_accept {
        reasons.push("strong margin");
    } else if profitability <= policy.profitability_reject {
        reasons.push("thin margin");
    }

    match ctx.behavioral_score {
        Some(b) if b > policy.high_behavior_cutoff => reasons.push("selective: favorable conditions"),
        Some(b) if b < policy.low_behavior_cutoff => reasons.push("lenient: weak conditions"),
        _ => {}
    }

    reasons.into_iter().map(str::to_string).collect()
}

pub fn score_offer(offer: &Offer, ctx: &DriverContext, config: &AggregationConfig) -> ScoredOffer {
    let settings = config.source(&offer.source_id);
    let internal = settings.is_some_and(|s| s.internal);
    let commission_rate = settings.map_or(0.0, |s| s.commission_rate);

    let sub = sub_scores(offer, ctx, config);
    let score = composite_score(&sub, &config.weights);
    let commission = expected_commission(offer.fare_minor, commission_rate);
    let cost = variable_cost(offer.distance_km, &config.costs);
    let profitability = profitability_score(offer.fare_minor, commission, cost);
    let threshold = acceptance_threshold(ctx.behavioral_score, internal, &config.decision);
    let recommendation = decide(score, profitability, threshold, &config.decision);

    let rationale = rationale(RationaleInput {
        offer,
        ctx,
        sub: &sub,
        internal,
        profitability,
        policy: &config.decision,
    });

    ScoredOffer {
        offer: offer.clone(),
        score,
        sub_scores: sub,
        expected_commission_minor: commission,
        profitability_score: profitability,
        recommendation,
        acceptance_threshold: threshold,
        confidence: confidence(&ctx.stats),
        rationale,
    }
}

pub fn score_all(offers: &[Offer], ctx: &DriverContext, config: &AggregationConfig) -> Vec<ScoredOffer> {
    offers.iter().map(|offer| score_offer(offer, ctx, config)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use roar_core::{Area, Pickup};

    const PICKUP: GeoPoint = GeoPoint {
        lat: 52.5219,
        lng: 13.4132,
    };

    fn offer(source_id: &str, fare_minor: u64, distance_km: f64, rating: Option<f64>, urgency: UrgencyTier) -> Offer {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
        Offer {
            id: format!("{source_id}-1"),
            source_id: source_id.into(),
            pickup: Pickup {
                point: PICKUP,
                address: "Alexanderplatz".into(),
                requested_at: t0 + Duration::minutes(10),
            },
            dropoff: None,
            fare_minor,
            distance_km,
            duration_min: 10.0,
            counterpart_rating: rating,
            special_requests: None,
            urgency,
            created_at: t0,
            expires_at: t0 + Duration::minutes(15),
        }
    }

    fn driver_at_km(km: f64) -> DriverContext {
        // One degree of latitude is ~111.2 km.
        let mut ctx = DriverContext::new("d-1");
        ctx.location = Some(GeoPoint::new(PICKUP.lat - km / 111.195, PICKUP.lng));
        ctx
    }

    #[test]
    fn proximity_is_piecewise_linear() {
        let bands = ScoringBands::default();
        assert_eq!(proximity_score(Some(PICKUP), PICKUP, &bands), 100.0);
        assert_eq!(proximity_score(None, PICKUP, &bands), 50.0);

        let ten_km = driver_at_km(10.5).location;
        let mid = proximity_score(ten_km, PICKUP, &bands);
        assert!((mid - 50.0).abs() < 0.5, "got {mid}");

        let far = driver_at_km(25.0).location;
        assert_eq!(proximity_score(far, PICKUP, &bands), 0.0);
    }

    #[test]
    fn fare_rating_source_and_urgency_sub_scores() {
        let bands = ScoringBands::default();
        let costs = CostSettings::default();
        assert_eq!(fare_score(300, &costs, &bands), 20.0);
        assert_eq!(fare_score(5_000, &costs, &bands), 100.0);
        assert_eq!(fare_score(9_000, &costs, &bands), 100.0);
        assert!((fare_score(2_750, &costs, &bands) - 60.0).abs() < 1e-9);

        assert_eq!(rating_score(Some(4.0), &bands), 80.0);
        assert_eq!(rating_score(None, &bands), 50.0);

        let config = AggregationConfig::default();
        assert_eq!(source_score(config.source("direct"), &bands), 100.0);
        assert_eq!(source_score(config.source("unknown"), &bands), 50.0);

        assert_eq!(urgency_score(UrgencyTier::High, &bands), 100.0);
        assert_eq!(urgency_score(UrgencyTier::Medium, &bands), 70.0);
        assert_eq!(urgency_score(UrgencyTier::Low, &bands), 40.0);
    }

    #[test]
    fn profitability_handles_edges() {
        assert_eq!(profitability_score(0, 0, 0), 0);
        assert_eq!(profitability_score(1_000, 100, 0), 100);
        assert_eq!(profitability_score(1_000, 250, 300), 95);
        assert_eq!(profitability_score(1_000, 250, 2_000), 0);
        assert_eq!(expected_commission(1_250, 0.2), 250);
        assert_eq!(variable_cost(4.5, &CostSettings::default()), 135);
    }

    #[test]
    fn threshold_follows_behavioral_score_and_channel() {
        let policy = DecisionPolicy::default();
        assert_eq!(acceptance_threshold(None, false, &policy), 60.0);
        assert_eq!(acceptance_threshold(Some(30.0), false, &policy), 50.0);
        assert_eq!(acceptance_threshold(Some(80.0), false, &policy), 70.0);
        assert_eq!(acceptance_threshold(Some(55.0), true, &policy), 55.0);
        assert_eq!(acceptance_threshold(Some(20.0), true, &policy), 45.0);
    }

    #[test]
    fn decision_bands() {
        let policy = DecisionPolicy::default();
        assert_eq!(decide(10, 75, 60.0, &policy), Recommendation::Accept);
        assert_eq!(decide(95, 25, 60.0, &policy), Recommendation::Reject);
        assert_eq!(decide(60, 50, 60.0, &policy), Recommendation::Accept);
        assert_eq!(decide(52, 50, 60.0, &policy), Recommendation::Neutral);
        assert_eq!(decide(45, 50, 60.0, &policy), Recommendation::WaitForBetter);
    }

    #[test]
    fn confidence_uses_driver_stats_only() {
        assert_eq!(confidence(&DriverStats::default()), 0.5);
        let veteran = DriverStats {
            ride_count: 500,
            rating: Some(4.8),
            acceptance_rate: Some(1.0),
        };
        assert_eq!(confidence(&veteran), 1.0);
        let halfway = DriverStats {
            ride_count: 100,
            rating: Some(4.2),
            acceptance_rate: Some(0.7),
        };
        assert_eq!(confidence(&halfway), 0.79);
    }

    #[test]
    fn close_high_fare_internal_offer_is_accepted() {
        let config = AggregationConfig::default();
        let ctx = driver_at_km(1.0);
        let scored = score_offer(&offer("direct", 3_000, 1.0, Some(4.9), UrgencyTier::High), &ctx, &config);

        assert!(scored.score >= 85, "score {}", scored.score);
        assert_eq!(scored.recommendation, Recommendation::Accept);
        assert_eq!(scored.expected_commission_minor, 300);
        assert_eq!(scored.profitability_score, 100);
        assert_eq!(scored.acceptance_threshold, 55.0);
        assert_eq!(
            scored.rationale,
            vec![
                "very close pickup",
                "highly rated counterpart",
                "direct booking channel",
                "urgent pickup",
                "strong margin",
            ]
        );
    }

    #[test]
    fn distant_cheap_unrated_offer_is_rejected() {
        let config = AggregationConfig::default();
        let ctx = driver_at_km(22.0);
        let scored = score_offer(&offer("metrotaxi", 600, 22.0, None, UrgencyTier::Low), &ctx, &config);

        assert!(scored.score <= 35, "score {}", scored.score);
        assert_eq!(scored.recommendation, Recommendation::Reject);
        assert_eq!(scored.profitability_score, 15);
        assert_eq!(
            scored.rationale,
            vec!["distant pickup", "low fare", "no counterpart rating", "thin margin"]
        );
    }

    #[test]
    fn missing_driver_data_uses_neutral_defaults() {
        let config = AggregationConfig::default();
        let mut ctx = DriverContext::new("d-2");
        ctx.behavioral_score = Some(85.0);
        ctx.recommended_zones = vec![Area::Circle {
            name: "alex".into(),
            center: PICKUP,
            radius_m: 500.0,
        }];
        let scored = score_offer(&offer("ghost", 1_500, 3.0, Some(2.5), UrgencyTier::Medium), &ctx, &config);

        assert_eq!(scored.sub_scores.proximity, 50.0);
        assert_eq!(scored.sub_scores.source, 50.0);
        assert_eq!(scored.expected_commission_minor, 0);
        assert_eq!(scored.acceptance_threshold, 70.0);
        assert_eq!(
            scored.rationale,
            vec![
                "driver location unknown",
                "low counterpart rating",
                "pickup in recommended zone",
                "strong margin",
                "selective: favorable conditions",
            ]
        );
    }

    #[test]
    fn scores_stay_in_range_for_extreme_inputs() {
        let config = AggregationConfig::default();
        let ctx = driver_at_km(0.0);
        for (fare, distance) in [(0, 0.0), (u32::MAX as u64, 0.0), (100, 10_000.0), (1, f64::MAX / 1e10)] {
            let scored = score_offer(&offer("swiftcab", fare, distance, Some(5.0), UrgencyTier::High), &ctx, &config);
            assert!(scored.score <= 100);
            assert!(scored.profitability_score <= 100);
            assert!((0.0..=1.0).contains(&scored.confidence));
        }
    }
}
