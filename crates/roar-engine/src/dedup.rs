//! Geo-temporal clustering of offers that describe the same physical ride request.

use chrono::Duration;
use roar_core::{haversine_meters, AggregationConfig, Offer};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorbedOffer {
    pub offer_id: String,
    pub source_id: String,
}

impl AbsorbedOffer {
    fn of(offer: &Offer) -> Self {
        Self {
            offer_id: offer.id.clone(),
            source_id: offer.source_id.clone(),
        }
    }
}

/// A cluster that merged at least two offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupCluster {
    pub representative_id: String,
    pub representative_source: String,
    pub absorbed: Vec<AbsorbedOffer>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupOutcome {
    pub kept: Vec<Offer>,
    pub clusters: Vec<DedupCluster>,
}

struct Cluster {
    /// Input position of the current representative; output is ordered by it.
    input_index: usize,
    representative: Offer,
    absorbed: Vec<AbsorbedOffer>,
}

#[derive(Debug, Clone)]
pub struct DedupEngine {
    radius_m: f64,
    window: Duration,
    priorities: Vec<(String, u32)>,
}

impl DedupEngine {
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            radius_m: config.dedup.radius_m,
            window: Duration::try_minutes(config.dedup.window_minutes).unwrap_or(Duration::MAX),
            priorities: config
                .sources
                .iter()
                .map(|s| (s.source_id.clone(), s.priority))
                .collect(),
        }
    }

    /// Unknown sources rank below every configured one.
    pub fn priority(&self, source_id: &str) -> u32 {
        self.priorities
            .iter()
            .find(|(id, _)| id == source_id)
            .map(|(_, p)| *p)
            .unwrap_or(0)
    }

    pub fn is_duplicate(&self, a: &Offer, b: &Offer) -> bool {
        let gap = (a.pickup.requested_at - b.pickup.requested_at).abs();
        gap < self.window && haversine_meters(a.pickup.point, b.pickup.point) < self.radius_m
    }

    /// Pairwise-greedy clustering in input order.
    ///
    /// Each offer joins the first existing cluster it matches; the cluster keeps whichever
    /// member comes from the higher-priority source (the incumbent wins ties). Survivors are
    /// returned in the input order of their representatives.
    pub fn apply(&self, offers: Vec<Offer>) -> DedupOutcome {
        let mut clusters: Vec<Cluster> = Vec::new();

        for (input_index, candidate) in offers.into_iter().enumerate() {
            let matched = clusters
                .iter()
                .position(|c| self.is_duplicate(&c.representative, &candidate));
            let Some(pos) = matched else {
                clusters.push(Cluster {
                    input_index,
                    representative: candidate,
                    absorbed: Vec::new(),
                });
                continue;
            };

            let cluster = &mut clusters[pos];
            if self.priority(&candidate.source_id) > self.priority(&cluster.representative.source_id) {
                let displaced = std::mem::replace(&mut cluster.representative, candidate);
                cluster.input_index = input_index;
                debug!(
                    kept = %cluster.representative.id,
                    dropped = %displaced.id,
                    "duplicate replaced by higher-priority source"
                );
                cluster.absorbed.push(AbsorbedOffer::of(&displaced));
            } else {
                debug!(kept = %cluster.representative.id, dropped = %candidate.id, "duplicate dropped");
                cluster.absorbed.push(AbsorbedOffer::of(&candidate));
            }
        }

        clusters.sort_by_key(|c| c.input_index);

        let mut outcome = DedupOutcome::default();
        for cluster in clusters {
            if !cluster.absorbed.is_empty() {
                outcome.clusters.push(DedupCluster {
                    representative_id: cluster.representative.id.clone(),
                    representative_source: cluster.representative.source_id.clone(),
                    absorbed: cluster.absorbed,
                });
            }
            outcome.kept.push(cluster.representative);
        }
        outcome
    }
}
