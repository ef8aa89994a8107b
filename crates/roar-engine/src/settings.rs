use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use roar_core::AggregationConfig;
use roar_sources::{build_source_ports, HttpClientConfig, HttpFetcher, SourceRegistry};
use tokio::fs;
use tracing::info;

use crate::{AggregationPipeline, JsonFileContextProvider, ReportSink};

/// Process-level settings read from `ROAR_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub config_path: PathBuf,
    pub sources_path: PathBuf,
    pub reports_dir: PathBuf,
    pub contexts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
    /// Driver whose context the scheduled cycles run for.
    pub scheduled_driver: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./aggregation.yaml"),
            sources_path: PathBuf::from("./sources.yaml"),
            reports_dir: PathBuf::from("./reports"),
            contexts_dir: PathBuf::from("./contexts"),
            user_agent: "roar-bot/0.1".to_string(),
            http_timeout_secs: 10,
            workspace_root: PathBuf::from("."),
            web_port: 8080,
            scheduler_enabled: false,
            cycle_cron: "0 */5 * * * *".to_string(),
            scheduled_driver: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: env_path("ROAR_CONFIG").unwrap_or(defaults.config_path),
            sources_path: env_path("ROAR_SOURCES").unwrap_or(defaults.sources_path),
            reports_dir: env_path("ROAR_REPORTS_DIR").unwrap_or(defaults.reports_dir),
            contexts_dir: env_path("ROAR_CONTEXTS_DIR").unwrap_or(defaults.contexts_dir),
            user_agent: std::env::var("ROAR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("ROAR_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            workspace_root: env_path("ROAR_WORKSPACE_ROOT").unwrap_or(defaults.workspace_root),
            web_port: env_parse("ROAR_WEB_PORT").unwrap_or(defaults.web_port),
            scheduler_enabled: std::env::var("ROAR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            cycle_cron: std::env::var("ROAR_CYCLE_CRON").unwrap_or(defaults.cycle_cron),
            scheduled_driver: std::env::var("ROAR_SCHEDULED_DRIVER").ok().filter(|v| !v.trim().is_empty()),
        }
    }

    /// Relative paths are taken from the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn context_provider(&self) -> JsonFileContextProvider {
        JsonFileContextProvider::new(self.resolve(&self.contexts_dir))
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse and validate an aggregation config. Missing sections take their defaults.
pub async fn load_aggregation_config(path: &Path) -> Result<AggregationConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: AggregationConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load both config files, build the source ports and attach a report sink.
pub async fn pipeline_from_settings(settings: &EngineSettings) -> Result<AggregationPipeline> {
    let config = load_aggregation_config(&settings.resolve(&settings.config_path)).await?;
    let registry = load_source_registry(&settings.resolve(&settings.sources_path)).await?;
    let http = Arc::new(HttpFetcher::new(settings.http_client_config())?);
    let ports = build_source_ports(&registry, http, &settings.workspace_root, config.costs.minor_units_per_unit)?;

    let reports_dir = settings.resolve(&settings.reports_dir);
    let pipeline = AggregationPipeline::new(config, ports)
        .context("assembling aggregation pipeline")?
        .with_sink(Arc::new(ReportSink::new(&reports_dir)));
    info!(sources = registry.sources.len(), reports_dir = %reports_dir.display(), "pipeline ready");
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn workspace_settings(reports: &Path) -> EngineSettings {
        EngineSettings {
            workspace_root: workspace_root(),
            reports_dir: reports.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn shipped_config_files_load_and_validate() {
        let root = workspace_root();
        let config = load_aggregation_config(&root.join("aggregation.yaml")).await.unwrap();
        assert_eq!(
            config.sources.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>(),
            vec!["direct", "cityride", "swiftcab", "metrotaxi"]
        );
        let registry = load_source_registry(&root.join("sources.yaml")).await.unwrap();
        assert_eq!(registry.sources.len(), 4);
    }

    #[tokio::test]
    async fn invalid_yaml_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregation.yaml");
        std::fs::write(&path, "weights:\n  proximity: 0.9\n").unwrap();
        let err = load_aggregation_config(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("sum to 1.0"), "{err:#}");
    }

    #[tokio::test]
    async fn pipeline_builds_from_workspace_files() {
        let reports = tempfile::tempdir().unwrap();
        let settings = workspace_settings(reports.path());
        let pipeline = pipeline_from_settings(&settings).await.unwrap();
        assert_eq!(pipeline.sink_name(), "reports");
        assert_eq!(pipeline.config().max_results, 20);
    }

    #[test]
    fn relative_paths_resolve_against_workspace_root() {
        let settings = EngineSettings {
            workspace_root: PathBuf::from("/srv/roar"),
            ..Default::default()
        };
        assert_eq!(settings.resolve(Path::new("contexts")), PathBuf::from("/srv/roar/contexts"));
        assert_eq!(settings.resolve(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
