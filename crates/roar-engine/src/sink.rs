//! Publication of finished cycles: per-cycle report directories with JSON, Markdown and Parquet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array, UInt8Array};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::CycleOutcome;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing cycle output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("building record batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("writing parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Consumer of finished cycles. Failures are reported, never propagated into the ranking.
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, outcome: &CycleOutcome) -> Result<(), SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl ResultSink for NoopSink {
    fn name(&self) -> &str {
        "noop"
    }

    async fn publish(&self, _outcome: &CycleOutcome) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub cycle_id: Uuid,
    pub files: Vec<ReportFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<root>/<cycle_id>/` with the ranked list, a Markdown brief, a Parquet snapshot and a
/// checksum manifest.
#[derive(Debug, Clone)]
pub struct ReportSink {
    root: PathBuf,
}

impl ReportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cycle_dir(&self, cycle_id: Uuid) -> PathBuf {
        self.root.join(cycle_id.to_string())
    }
}

#[async_trait]
impl ResultSink for ReportSink {
    fn name(&self) -> &str {
        "reports"
    }

    async fn publish(&self, outcome: &CycleOutcome) -> Result<(), SinkError> {
        let dir = self.cycle_dir(outcome.cycle_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SinkError::io(&dir, e))?;

        let ranked = serde_json::to_vec_pretty(outcome)?;
        let brief = cycle_brief_markdown(outcome).into_bytes();
        let parquet = scored_offers_parquet(outcome)?;

        let files = vec![
            write_atomic(&dir, "ranked_offers.json", &ranked).await?,
            write_atomic(&dir, "cycle_brief.md", &brief).await?,
            write_atomic(&dir, "scored_offers.parquet", &parquet).await?,
        ];
        let manifest = ReportManifest {
            schema_version: 1,
            cycle_id: outcome.cycle_id,
            files,
        };
        write_atomic(&dir, "manifest.json", &serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write via a hidden temp file in the same directory, then rename into place.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<ReportFile, SinkError> {
    let target = dir.join(name);
    let temp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp)
        .await
        .map_err(|e| SinkError::io(&temp, e))?;
    file.write_all(bytes).await.map_err(|e| SinkError::io(&temp, e))?;
    file.flush().await.map_err(|e| SinkError::io(&temp, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp, &target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(SinkError::io(&target, err));
    }

    Ok(ReportFile {
        name: name.to_string(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

pub fn cycle_brief_markdown(outcome: &CycleOutcome) -> String {
    let stats = &outcome.stats;
    let mut lines = vec![
        "# ROAR Cycle Brief".to_string(),
        String::new(),
        format!("- Cycle ID: `{}`", outcome.cycle_id),
        format!("- Driver: `{}`", outcome.driver_id),
        format!("- Started: {}", outcome.started_at.to_rfc3339()),
        format!("- Finished: {}", outcome.finished_at.to_rfc3339()),
        format!(
            "- Offers: {} fetched, {} expired, {} after dedup, {} after filter, {} returned",
            stats.fetched, stats.expired_dropped, stats.after_dedup, stats.after_filter, stats.returned
        ),
        String::new(),
        "## Ranked Offers".to_string(),
    ];

    if outcome.ranked.is_empty() {
        lines.push("- none".to_string());
    } else {
        lines.push("| # | offer | source | score | profitability | recommendation |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for (i, scored) in outcome.ranked.iter().enumerate() {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} |",
                i + 1,
                scored.offer.id,
                scored.offer.source_id,
                scored.score,
                scored.profitability_score,
                scored.recommendation.as_str()
            ));
        }
    }

    let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
    for scored in &outcome.ranked {
        *per_source.entry(scored.offer.source_id.as_str()).or_default() += 1;
    }
    lines.push(String::new());
    lines.push("## Sources".to_string());
    for report in &outcome.sources {
        let status = match &report.failure_reason {
            Some(reason) => format!("failed ({reason})"),
            None => format!(
                "{} fetched, {} ranked",
                report.offer_count,
                per_source.get(report.source_id.as_str()).copied().unwrap_or(0)
            ),
        };
        lines.push(format!("- {}: {} in {}ms", report.source_id, status, report.elapsed_ms));
    }

    if !outcome.clusters.is_empty() {
        lines.push(String::new());
        lines.push("## Merged Duplicates".to_string());
        for cluster in &outcome.clusters {
            let absorbed = cluster
                .absorbed
                .iter()
                .map(|a| format!("{} ({})", a.offer_id, a.source_id))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!(
                "- {} ({}) absorbed {}",
                cluster.representative_id, cluster.representative_source, absorbed
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

pub fn scored_offers_batch(outcome: &CycleOutcome) -> Result<RecordBatch, ArrowError> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("rank", DataType::UInt32, false),
        Field::new("offer_id", DataType::Utf8, false),
        Field::new("source_id", DataType::Utf8, false),
        Field::new("score", DataType::UInt8, false),
        Field::new("profitability_score", DataType::UInt8, false),
        Field::new("recommendation", DataType::Utf8, false),
        Field::new("fare_minor", DataType::UInt64, false),
        Field::new("expected_commission_minor", DataType::UInt64, false),
        Field::new("counterpart_rating", DataType::Float64, true),
        Field::new("confidence", DataType::Float64, false),
        Field::new("pickup_at", DataType::Utf8, false),
    ]));

    let ranked = &outcome.ranked;
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from((1..=ranked.len() as u32).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            ranked.iter().map(|s| s.offer.id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            ranked.iter().map(|s| s.offer.source_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt8Array::from(ranked.iter().map(|s| s.score).collect::<Vec<_>>())),
        Arc::new(UInt8Array::from(
            ranked.iter().map(|s| s.profitability_score).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            ranked.iter().map(|s| s.recommendation.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(ranked.iter().map(|s| s.offer.fare_minor).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(
            ranked.iter().map(|s| s.expected_commission_minor).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            ranked.iter().map(|s| s.offer.counterpart_rating).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(ranked.iter().map(|s| s.confidence).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            ranked
                .iter()
                .map(|s| s.offer.pickup.requested_at.to_rfc3339())
                .collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, columns)
}

fn scored_offers_parquet(outcome: &CycleOutcome) -> Result<Vec<u8>, SinkError> {
    let batch = scored_offers_batch(outcome)?;
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}
