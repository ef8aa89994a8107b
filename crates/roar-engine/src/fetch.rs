//! Concurrent fan-out over source ports with per-source timeouts and an overall cycle deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use roar_core::{AggregationConfig, ConfigError, DriverContext, Offer, SourceReport, SourceResult, SourceSettings};
use roar_sources::SourcePort;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

struct SourceSlot {
    settings: SourceSettings,
    port: Arc<dyn SourcePort>,
}

/// Result of one source in one cycle, in configuration declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFetch {
    pub source_id: String,
    pub result: SourceResult,
    pub elapsed_ms: u64,
    pub expired_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchOutcome {
    pub sources: Vec<SourceFetch>,
}

impl FetchOutcome {
    /// Failure report keyed by source id.
    pub fn failures(&self) -> BTreeMap<String, String> {
        self.sources
            .iter()
            .filter_map(|s| match &s.result {
                SourceResult::Failed { reason } => Some((s.source_id.clone(), reason.clone())),
                SourceResult::Offers { .. } => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<SourceReport> {
        self.sources
            .iter()
            .map(|s| match &s.result {
                SourceResult::Offers { offers } => SourceReport {
                    source_id: s.source_id.clone(),
                    succeeded: true,
                    offer_count: offers.len(),
                    elapsed_ms: s.elapsed_ms,
                    failure_reason: None,
                },
                SourceResult::Failed { reason } => SourceReport {
                    source_id: s.source_id.clone(),
                    succeeded: false,
                    offer_count: 0,
                    elapsed_ms: s.elapsed_ms,
                    failure_reason: Some(reason.clone()),
                },
            })
            .collect()
    }

    pub fn expired_dropped(&self) -> usize {
        self.sources.iter().map(|s| s.expired_dropped).sum()
    }

    /// Successful offers concatenated in source declaration order.
    pub fn merged_offers(&self) -> Vec<Offer> {
        self.sources
            .iter()
            .filter_map(|s| match &s.result {
                SourceResult::Offers { offers } => Some(offers.iter().cloned()),
                SourceResult::Failed { .. } => None,
            })
            .flatten()
            .collect()
    }
}

pub struct FetchCoordinator {
    slots: Vec<SourceSlot>,
    cycle_deadline: Duration,
}

impl FetchCoordinator {
    /// Pair every enabled configured source with its port, keeping declaration order.
    pub fn new(config: &AggregationConfig, ports: Vec<Arc<dyn SourcePort>>) -> Result<Self, ConfigError> {
        for port in &ports {
            if config.source(port.source_id()).is_none() {
                return Err(ConfigError::UnknownSourcePort(port.source_id().to_string()));
            }
        }

        let mut slots = Vec::new();
        for settings in config.enabled_sources() {
            let port = ports
                .iter()
                .find(|p| p.source_id() == settings.source_id)
                .cloned()
                .ok_or_else(|| ConfigError::MissingSourcePort(settings.source_id.clone()))?;
            slots.push(SourceSlot {
                settings: settings.clone(),
                port,
            });
        }

        Ok(Self {
            slots,
            cycle_deadline: Duration::from_millis(config.cycle_deadline_ms),
        })
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.settings.source_id.as_str())
    }

    pub async fn fetch_all(&self, ctx: &DriverContext, now: DateTime<Utc>) -> FetchOutcome {
        let started = Instant::now();
        let deadline = started + self.cycle_deadline;
        let ctx = Arc::new(ctx.clone());

        let handles = self
            .slots
            .iter()
            .map(|slot| {
                let port = slot.port.clone();
                let ctx = ctx.clone();
                let timeout = Duration::from_millis(slot.settings.timeout_ms);
                let span = info_span!("source_fetch", source_id = %slot.settings.source_id);
                tokio::spawn(
                    async move {
                        let task_started = Instant::now();
                        let result = match tokio::time::timeout(timeout, port.fetch_offers(&ctx)).await {
                            Ok(Ok(offers)) => Ok(offers),
                            Ok(Err(err)) => Err(err.to_string()),
                            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                        };
                        (result, task_started.elapsed())
                    }
                    .instrument(span),
                )
            })
            .collect::<Vec<_>>();

        let mut sources = Vec::with_capacity(self.slots.len());
        for (slot, mut handle) in self.slots.iter().zip(handles) {
            let source_id = slot.settings.source_id.clone();
            let (result, elapsed) = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok((result, elapsed))) => (result, elapsed),
                Ok(Err(join_err)) => (Err(format!("fetch task failed: {join_err}")), started.elapsed()),
                Err(_) => {
                    handle.abort();
                    (
                        Err(format!(
                            "cycle deadline of {}ms exceeded",
                            self.cycle_deadline.as_millis()
                        )),
                        started.elapsed(),
                    )
                }
            };

            let (result, expired_dropped) = match result.and_then(|offers| screen_offers(&slot.settings, offers, now)) {
                Ok((offers, expired)) => {
                    debug!(source_id = %source_id, offers = offers.len(), expired, "source fetch succeeded");
                    (SourceResult::Offers { offers }, expired)
                }
                Err(reason) => {
                    warn!(source_id = %source_id, %reason, "source fetch failed; excluding from cycle");
                    (SourceResult::Failed { reason }, 0)
                }
            };

            sources.push(SourceFetch {
                source_id,
                result,
                elapsed_ms: elapsed.as_millis() as u64,
                expired_dropped,
            });
        }

        FetchOutcome { sources }
    }
}

/// Reject malformed payloads, drop already-expired offers, then apply the per-source cap.
fn screen_offers(
    settings: &SourceSettings,
    offers: Vec<Offer>,
    now: DateTime<Utc>,
) -> Result<(Vec<Offer>, usize), String> {
    for offer in &offers {
        if offer.source_id != settings.source_id {
            return Err(format!(
                "malformed data: offer {} is tagged with source {}",
                offer.id, offer.source_id
            ));
        }
        offer.validate().map_err(|e| format!("malformed data: {e}"))?;
    }

    let total = offers.len();
    let mut live = offers
        .into_iter()
        .filter(|offer| !offer.is_expired_at(now))
        .collect::<Vec<_>>();
    let expired = total - live.len();
    live.truncate(settings.max_results);
    Ok((live, expired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use roar_core::{GeoPoint, Pickup, UrgencyTier};
    use roar_sources::{SourceError, SourceKind, StaticSource};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap()
    }

    fn offer(id: &str, source_id: &str) -> Offer {
        Offer {
            id: id.into(),
            source_id: source_id.into(),
            pickup: Pickup {
                point: GeoPoint::new(52.52, 13.40),
                address: String::new(),
                requested_at: now() + ChronoDuration::minutes(10),
            },
            dropoff: None,
            fare_minor: 1_000,
            distance_km: 3.0,
            duration_min: 10.0,
            counterpart_rating: None,
            special_requests: None,
            urgency: UrgencyTier::High,
            created_at: now() - ChronoDuration::minutes(1),
            expires_at: now() + ChronoDuration::minutes(10),
        }
    }

    struct SlowSource {
        id: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl SourcePort for SlowSource {
        fn source_id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> SourceKind {
            SourceKind::ExternalPlatform
        }

        async fn fetch_offers(&self, _ctx: &DriverContext) -> Result<Vec<Offer>, SourceError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![offer("slow-1", self.id)])
        }
    }

    fn two_source_config() -> AggregationConfig {
        AggregationConfig {
            sources: vec![
                SourceSettings::internal("direct", 100, 100.0, 0.1),
                SourceSettings::external("swiftcab", 60, 60.0, 0.25),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn construction_requires_ports_for_enabled_sources() {
        let config = two_source_config();
        let only_direct: Vec<Arc<dyn SourcePort>> =
            vec![Arc::new(StaticSource::offers("direct", SourceKind::DirectChannel, vec![]))];
        assert!(matches!(
            FetchCoordinator::new(&config, only_direct),
            Err(ConfigError::MissingSourcePort(id)) if id == "swiftcab"
        ));

        let stray: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers("direct", SourceKind::DirectChannel, vec![])),
            Arc::new(StaticSource::offers("swiftcab", SourceKind::ExternalPlatform, vec![])),
            Arc::new(StaticSource::offers("ghost", SourceKind::ExternalPlatform, vec![])),
        ];
        assert!(matches!(
            FetchCoordinator::new(&config, stray),
            Err(ConfigError::UnknownSourcePort(id)) if id == "ghost"
        ));
    }

    #[test]
    fn disabled_sources_are_skipped() {
        let mut config = two_source_config();
        config.sources[1].enabled = false;
        let ports: Vec<Arc<dyn SourcePort>> =
            vec![Arc::new(StaticSource::offers("direct", SourceKind::DirectChannel, vec![]))];
        let coordinator = FetchCoordinator::new(&config, ports).unwrap();
        assert_eq!(coordinator.source_ids().collect::<Vec<_>>(), vec!["direct"]);
    }

    #[tokio::test]
    async fn merged_order_follows_declaration_not_completion() {
        let mut config = two_source_config();
        config.sources[0].timeout_ms = 1_000;
        // direct is slow, swiftcab answers instantly; direct must still come first.
        let ports: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers(
                "swiftcab",
                SourceKind::ExternalPlatform,
                vec![offer("sc-1", "swiftcab")],
            )),
            Arc::new(SlowSource {
                id: "direct",
                delay: Duration::from_millis(50),
            }),
        ];
        let coordinator = FetchCoordinator::new(&config, ports).unwrap();
        let outcome = coordinator.fetch_all(&DriverContext::new("d"), now()).await;
        let ids = outcome.merged_offers().into_iter().map(|o| o.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["slow-1", "sc-1"]);
        assert!(outcome.failures().is_empty());
    }

    #[tokio::test]
    async fn per_source_timeout_is_isolated() {
        let mut config = two_source_config();
        config.sources[1].timeout_ms = 20;
        let ports: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers(
                "direct",
                SourceKind::DirectChannel,
                vec![offer("d-1", "direct")],
            )),
            Arc::new(SlowSource {
                id: "swiftcab",
                delay: Duration::from_secs(5),
            }),
        ];
        let coordinator = FetchCoordinator::new(&config, ports).unwrap();
        let outcome = coordinator.fetch_all(&DriverContext::new("d"), now()).await;

        let failures = outcome.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures["swiftcab"].contains("timed out"));
        assert_eq!(outcome.merged_offers().len(), 1);
        let reports = outcome.reports();
        assert!(reports[0].succeeded);
        assert!(!reports[1].succeeded);
    }

    #[tokio::test]
    async fn cycle_deadline_bounds_the_whole_fetch() {
        let mut config = two_source_config();
        config.cycle_deadline_ms = 50;
        config.sources[1].timeout_ms = 10_000;
        let ports: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers("direct", SourceKind::DirectChannel, vec![])),
            Arc::new(SlowSource {
                id: "swiftcab",
                delay: Duration::from_secs(10),
            }),
        ];
        let coordinator = FetchCoordinator::new(&config, ports).unwrap();
        let started = std::time::Instant::now();
        let outcome = coordinator.fetch_all(&DriverContext::new("d"), now()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.failures()["swiftcab"].contains("deadline"));
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_whole_source() {
        let config = two_source_config();
        let mut broken = offer("sc-2", "swiftcab");
        broken.counterpart_rating = Some(9.0);
        let ports: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers(
                "direct",
                SourceKind::DirectChannel,
                vec![offer("d-9", "swiftcab")],
            )),
            Arc::new(StaticSource::offers(
                "swiftcab",
                SourceKind::ExternalPlatform,
                vec![offer("sc-1", "swiftcab"), broken],
            )),
        ];
        let coordinator = FetchCoordinator::new(&config, ports).unwrap();
        let outcome = coordinator.fetch_all(&DriverContext::new("d"), now()).await;
        let failures = outcome.failures();
        assert!(failures["direct"].contains("tagged with source swiftcab"));
        assert!(failures["swiftcab"].contains("malformed"));
        assert!(outcome.merged_offers().is_empty());
    }

    #[test]
    fn screening_drops_expired_then_caps() {
        let mut settings = SourceSettings::external("swiftcab", 60, 60.0, 0.25);
        settings.max_results = 2;
        let mut expired = offer("sc-0", "swiftcab");
        expired.expires_at = now();
        let offers = vec![
            expired,
            offer("sc-1", "swiftcab"),
            offer("sc-2", "swiftcab"),
            offer("sc-3", "swiftcab"),
        ];
        let (kept, dropped) = screen_offers(&settings, offers, now()).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(kept.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["sc-1", "sc-2"]);
    }
}
