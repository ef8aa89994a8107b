//! Aggregation configuration: source table, dedup window, scoring weights, decision policy.
//!
//! The configuration is read-only input for the duration of a cycle. It is validated once
//! at load time; a config that fails [`AggregationConfig::validate`] never reaches a cycle.

use std::collections::HashSet;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("score weights must sum to 1.0 (got {sum:.6})")]
    WeightSum { sum: f64 },
    #[error("score weight `{name}` must be finite and non-negative (got {value})")]
    NegativeWeight { name: &'static str, value: f64 },
    #[error("`{field}` must be positive")]
    NonPositive { field: String },
    #[error("`{field}` must lie within {min}..={max} (got {value})")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("source `{0}` is configured more than once")]
    DuplicateSource(String),
    #[error("sources `{first}` and `{second}` share priority {priority}; priority must be a total order")]
    DuplicatePriority {
        first: String,
        second: String,
        priority: u32,
    },
    #[error("profitability reject cutoff {reject} must be below accept cutoff {accept}")]
    CutoffOrder { accept: f64, reject: f64 },
    #[error("at least one source must be enabled")]
    NoEnabledSources,
    #[error("enabled source `{0}` has no registered source port")]
    MissingSourcePort(String),
    #[error("source port `{0}` is not declared in the aggregation config")]
    UnknownSourcePort(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Marks the internal direct-booking channel.
    #[serde(default)]
    pub internal: bool,
    /// Dedup tie-break; higher wins.
    pub priority: u32,
    /// Source preference sub-score, 0-100.
    pub desirability: f64,
    pub commission_rate: f64,
    #[serde(default = "default_source_max_results")]
    pub max_results: usize,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
}

impl SourceSettings {
    pub fn external(source_id: &str, priority: u32, desirability: f64, commission_rate: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            enabled: true,
            internal: false,
            priority,
            desirability,
            commission_rate,
            max_results: default_source_max_results(),
            timeout_ms: default_source_timeout_ms(),
        }
    }

    pub fn internal(source_id: &str, priority: u32, desirability: f64, commission_rate: f64) -> Self {
        Self {
            internal: true,
            ..Self::external(source_id, priority, desirability, commission_rate)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub radius_m: f64,
    pub window_minutes: i64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            radius_m: 200.0,
            window_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub proximity: f64,
    pub fare: f64,
    pub rating: f64,
    pub source: f64,
    pub urgency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            proximity: 0.30,
            fare: 0.25,
            rating: 0.15,
            source: 0.15,
            urgency: 0.15,
        }
    }
}

impl ScoreWeights {
    fn named(&self) -> [(&'static str, f64); 5] {
        [
            ("proximity", self.proximity),
            ("fare", self.fare),
            ("rating", self.rating),
            ("source", self.source),
            ("urgency", self.urgency),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.named().iter().map(|(_, w)| w).sum()
    }
}

/// Breakpoints of the piecewise-linear sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringBands {
    pub proximity_full_km: f64,
    pub proximity_zero_km: f64,
    pub fare_floor_units: f64,
    pub fare_ceiling_units: f64,
    pub fare_floor_score: f64,
    pub urgency_high: f64,
    pub urgency_medium: f64,
    pub urgency_low: f64,
    pub neutral: f64,
}

impl Default for ScoringBands {
    fn default() -> Self {
        Self {
            proximity_full_km: 1.0,
            proximity_zero_km: 20.0,
            fare_floor_units: 5.0,
            fare_ceiling_units: 50.0,
            fare_floor_score: 20.0,
            urgency_high: 100.0,
            urgency_medium: 70.0,
            urgency_low: 40.0,
            neutral: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicy {
    pub base_threshold: f64,
    pub low_behavior_cutoff: f64,
    pub high_behavior_cutoff: f64,
    /// Subtracted from the threshold when the behavioral score is low.
    pub low_behavior_delta: f64,
    /// Added to the threshold when the behavioral score is high.
    pub high_behavior_delta: f64,
    pub internal_channel_delta: f64,
    /// Scores this close below the threshold are `neutral`; further below is `wait_for_better`.
    pub neutral_margin: f64,
    pub profitability_accept: f64,
    pub profitability_reject: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            base_threshold: 60.0,
            low_behavior_cutoff: 40.0,
            high_behavior_cutoff: 70.0,
            low_behavior_delta: 10.0,
            high_behavior_delta: 10.0,
            internal_channel_delta: 5.0,
            neutral_margin: 10.0,
            profitability_accept: 70.0,
            profitability_reject: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    pub variable_cost_per_km_minor: f64,
    pub minor_units_per_unit: u64,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            variable_cost_per_km_minor: 30.0,
            minor_units_per_unit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub max_results: usize,
    pub cycle_deadline_ms: u64,
    /// Declaration order is the fixed source iteration order of every cycle.
    pub sources: Vec<SourceSettings>,
    pub dedup: DedupSettings,
    pub weights: ScoreWeights,
    pub bands: ScoringBands,
    pub decision: DecisionPolicy,
    pub costs: CostSettings,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_results: 20,
            cycle_deadline_ms: 5_000,
            sources: vec![
                SourceSettings::internal("direct", 100, 100.0, 0.10),
                SourceSettings::external("cityride", 80, 70.0, 0.20),
                SourceSettings::external("swiftcab", 60, 60.0, 0.25),
                SourceSettings::external("metrotaxi", 40, 40.0, 0.25),
            ],
            dedup: DedupSettings::default(),
            weights: ScoreWeights::default(),
            bands: ScoringBands::default(),
            decision: DecisionPolicy::default(),
            costs: CostSettings::default(),
        }
    }
}

impl AggregationConfig {
    pub fn source(&self, source_id: &str) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceSettings> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in self.weights.named() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NegativeWeight { name, value });
            }
        }
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }

        require_positive("max_results", self.max_results as f64)?;
        require_positive("cycle_deadline_ms", self.cycle_deadline_ms as f64)?;
        require_positive("dedup.radius_m", self.dedup.radius_m)?;
        require_positive("dedup.window_minutes", self.dedup.window_minutes as f64)?;
        if TimeDelta::try_minutes(self.dedup.window_minutes).is_none() {
            return Err(ConfigError::OutOfRange {
                field: "dedup.window_minutes".to_string(),
                value: self.dedup.window_minutes as f64,
                min: 1.0,
                max: (TimeDelta::MAX.num_minutes()) as f64,
            });
        }
        require_positive("costs.minor_units_per_unit", self.costs.minor_units_per_unit as f64)?;
        require_range("costs.variable_cost_per_km_minor", self.costs.variable_cost_per_km_minor, 0.0, f64::MAX)?;

        let bands = &self.bands;
        require_positive("bands.proximity_zero_km", bands.proximity_zero_km - bands.proximity_full_km)?;
        require_positive("bands.fare_ceiling_units", bands.fare_ceiling_units - bands.fare_floor_units)?;
        for (field, value) in [
            ("bands.fare_floor_score", bands.fare_floor_score),
            ("bands.urgency_high", bands.urgency_high),
            ("bands.urgency_medium", bands.urgency_medium),
            ("bands.urgency_low", bands.urgency_low),
            ("bands.neutral", bands.neutral),
        ] {
            require_range(field, value, 0.0, 100.0)?;
        }

        let policy = &self.decision;
        for (field, value) in [
            ("decision.base_threshold", policy.base_threshold),
            ("decision.low_behavior_cutoff", policy.low_behavior_cutoff),
            ("decision.high_behavior_cutoff", policy.high_behavior_cutoff),
            ("decision.profitability_accept", policy.profitability_accept),
            ("decision.profitability_reject", policy.profitability_reject),
        ] {
            require_range(field, value, 0.0, 100.0)?;
        }
        for (field, value) in [
            ("decision.low_behavior_delta", policy.low_behavior_delta),
            ("decision.high_behavior_delta", policy.high_behavior_delta),
            ("decision.internal_channel_delta", policy.internal_channel_delta),
            ("decision.neutral_margin", policy.neutral_margin),
        ] {
            require_range(field, value, 0.0, 100.0)?;
        }
        if policy.profitability_reject >= policy.profitability_accept {
            return Err(ConfigError::CutoffOrder {
                accept: policy.profitability_accept,
                reject: policy.profitability_reject,
            });
        }

        let mut seen_ids = HashSet::new();
        let mut seen_priorities: Vec<(u32, &str)> = Vec::new();
        for source in &self.sources {
            if !seen_ids.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
            if let Some((_, first)) = seen_priorities.iter().find(|(p, _)| *p == source.priority) {
                return Err(ConfigError::DuplicatePriority {
                    first: first.to_string(),
                    second: source.source_id.clone(),
                    priority: source.priority,
                });
            }
            seen_priorities.push((source.priority, source.source_id.as_str()));

            let prefix = format!("sources.{}", source.source_id);
            require_positive(&format!("{prefix}.max_results"), source.max_results as f64)?;
            require_positive(&format!("{prefix}.timeout_ms"), source.timeout_ms as f64)?;
            require_range(&format!("{prefix}.desirability"), source.desirability, 0.0, 100.0)?;
            require_range(&format!("{prefix}.commission_rate"), source.commission_rate, 0.0, 1.0)?;
        }
        if self.enabled_sources().next().is_none() {
            return Err(ConfigError::NoEnabledSources);
        }
        Ok(())
    }
}

fn require_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive {
            field: field.to_string(),
        })
    }
}

fn require_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_source_max_results() -> usize {
    25
}

fn default_source_timeout_ms() -> u64 {
    2_000
}
