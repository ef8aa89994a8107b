//! Aggregation cycle orchestration: fetch, dedup, filter, score, rank, publish.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use roar_core::{AggregationConfig, ConfigError, DriverContext, Offer, ScoredOffer, SourceReport};
use roar_sources::SourcePort;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub mod context;
pub mod dedup;
pub mod fetch;
pub mod filter;
pub mod rank;
pub mod schedule;
pub mod scoring;
pub mod settings;
pub mod sink;

pub use context::{ContextError, DriverContextProvider, JsonFileContextProvider, StaticContextProvider};
pub use dedup::{AbsorbedOffer, DedupCluster, DedupEngine, DedupOutcome};
pub use fetch::{FetchCoordinator, FetchOutcome, SourceFetch};
pub use filter::{filter_offers, FilterOutcome, FilterReason, FilteredOffer};
pub use schedule::{build_scheduler, maybe_build_scheduler};
pub use settings::{load_aggregation_config, load_source_registry, pipeline_from_settings, EngineSettings};
pub use sink::{NoopSink, ReportSink, ResultSink, SinkError};

pub const CRATE_NAME: &str = "roar-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub fetched: usize,
    pub expired_dropped: usize,
    pub after_dedup: usize,
    pub after_filter: usize,
    pub scored: usize,
    pub returned: usize,
}

/// Everything a caller learns from one cycle. Always produced, even when every source failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub driver_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ranked: Vec<ScoredOffer>,
    /// Failure reason per failed source.
    pub failures: BTreeMap<String, String>,
    pub sources: Vec<SourceReport>,
    pub clusters: Vec<DedupCluster>,
    pub filtered: Vec<FilteredOffer>,
    pub stats: CycleStats,
}

/// Output of the synchronous stages that follow the fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    pub ranked: Vec<ScoredOffer>,
    pub clusters: Vec<DedupCluster>,
    pub filtered: Vec<FilteredOffer>,
    pub after_dedup: usize,
    pub after_filter: usize,
    pub scored: usize,
}

pub struct AggregationPipeline {
    config: Arc<AggregationConfig>,
    coordinator: FetchCoordinator,
    dedup: DedupEngine,
    sink: Arc<dyn ResultSink>,
}

impl std::fmt::Debug for AggregationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationPipeline")
            .field("sources", &self.coordinator.source_ids().collect::<Vec<_>>())
            .field("sink", &self.sink.name())
            .finish()
    }
}

impl AggregationPipeline {
    /// Validates the configuration and pairs every enabled source with its port.
    pub fn new(config: AggregationConfig, ports: Vec<Arc<dyn SourcePort>>) -> Result<Self, ConfigError> {
        config.validate()?;
        let coordinator = FetchCoordinator::new(&config, ports)?;
        let dedup = DedupEngine::new(&config);
        Ok(Self {
            config: Arc::new(config),
            coordinator,
            dedup,
            sink: Arc::new(NoopSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub async fn run_cycle(&self, ctx: &DriverContext) -> CycleOutcome {
        self.run_cycle_at(ctx, Utc::now()).await
    }

    /// Run one cycle as of `now`, which drives expiry screening and fixture replay.
    pub async fn run_cycle_at(&self, ctx: &DriverContext, now: DateTime<Utc>) -> CycleOutcome {
        let (outcome, _publication) = self.cycle(ctx, now).await;
        outcome
    }

    /// Like [`run_cycle`](Self::run_cycle) but also waits for the sink, for short-lived callers.
    pub async fn run_cycle_and_flush(&self, ctx: &DriverContext) -> CycleOutcome {
        let (outcome, publication) = self.cycle(ctx, Utc::now()).await;
        if let Err(err) = publication.await {
            warn!(error = %err, "sink task did not complete");
        }
        outcome
    }

    async fn cycle(&self, ctx: &DriverContext, now: DateTime<Utc>) -> (CycleOutcome, JoinHandle<()>) {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("aggregation_cycle", %cycle_id, driver_id = %ctx.driver_id);

        async move {
            let clock = Instant::now();
            let fetched = self.coordinator.fetch_all(ctx, now).await;
            let merged = fetched.merged_offers();
            let fetched_count = merged.len();
            let evaluation = self.evaluate(merged, ctx);

            let elapsed = TimeDelta::from_std(clock.elapsed()).unwrap_or(TimeDelta::zero());
            let outcome = CycleOutcome {
                cycle_id,
                driver_id: ctx.driver_id.clone(),
                started_at: now,
                finished_at: now + elapsed,
                stats: CycleStats {
                    fetched: fetched_count,
                    expired_dropped: fetched.expired_dropped(),
                    after_dedup: evaluation.after_dedup,
                    after_filter: evaluation.after_filter,
                    scored: evaluation.scored,
                    returned: evaluation.ranked.len(),
                },
                ranked: evaluation.ranked,
                failures: fetched.failures(),
                sources: fetched.reports(),
                clusters: evaluation.clusters,
                filtered: evaluation.filtered,
            };

            info!(
                fetched = outcome.stats.fetched,
                after_dedup = outcome.stats.after_dedup,
                after_filter = outcome.stats.after_filter,
                returned = outcome.stats.returned,
                failed_sources = outcome.failures.len(),
                "cycle complete"
            );
            let publication = self.publish(&outcome);
            (outcome, publication)
        }
        .instrument(span)
        .await
    }

    /// Dedup, filter, score and rank an already-fetched offer list.
    pub fn evaluate(&self, offers: Vec<Offer>, ctx: &DriverContext) -> Evaluation {
        let deduped = self.dedup.apply(offers);
        let after_dedup = deduped.kept.len();

        let filtered = filter_offers(deduped.kept, &ctx.preferences);
        let after_filter = filtered.kept.len();

        let scored = scoring::score_all(&filtered.kept, ctx, &self.config);
        let scored_count = scored.len();

        Evaluation {
            ranked: rank::rank(scored, self.config.max_results),
            clusters: deduped.clusters,
            filtered: filtered.dropped,
            after_dedup,
            after_filter,
            scored: scored_count,
        }
    }

    /// Hand the outcome to the sink on its own task; the ranking never waits on it.
    fn publish(&self, outcome: &CycleOutcome) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let outcome = outcome.clone();
        tokio::spawn(
            async move {
                if let Err(err) = sink.publish(&outcome).await {
                    warn!(sink = sink.name(), error = %err, "result sink failed; ranking unaffected");
                }
            }
            .instrument(Span::current()),
        )
    }
}
