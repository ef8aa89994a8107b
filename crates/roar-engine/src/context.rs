use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use roar_core::DriverContext;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unknown driver `{0}`")]
    UnknownDriver(String),
    #[error("invalid driver id `{0}`")]
    InvalidDriverId(String),
    #[error("reading context for driver `{driver_id}`: {source}")]
    Io {
        driver_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing context for driver `{driver_id}`: {source}")]
    Parse {
        driver_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where per-driver context comes from when a caller only knows the driver id.
#[async_trait]
pub trait DriverContextProvider: Send + Sync {
    async fn driver_context(&self, driver_id: &str) -> Result<DriverContext, ContextError>;
}

/// Reads `<dir>/<driver_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileContextProvider {
    dir: PathBuf,
}

impl JsonFileContextProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, driver_id: &str) -> Result<PathBuf, ContextError> {
        let valid = !driver_id.is_empty()
            && driver_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !valid {
            return Err(ContextError::InvalidDriverId(driver_id.to_string()));
        }
        Ok(self.dir.join(format!("{driver_id}.json")))
    }
}

#[async_trait]
impl DriverContextProvider for JsonFileContextProvider {
    async fn driver_context(&self, driver_id: &str) -> Result<DriverContext, ContextError> {
        let path = self.path_for(driver_id)?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::UnknownDriver(driver_id.to_string()))
            }
            Err(source) => {
                return Err(ContextError::Io {
                    driver_id: driver_id.to_string(),
                    source,
                })
            }
        };
        let mut ctx: DriverContext = serde_json::from_str(&text).map_err(|source| ContextError::Parse {
            driver_id: driver_id.to_string(),
            source,
        })?;
        // The file name is authoritative.
        ctx.driver_id = driver_id.to_string();
        Ok(ctx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider {
    contexts: BTreeMap<String, DriverContext>,
}

impl StaticContextProvider {
    pub fn new(contexts: impl IntoIterator<Item = DriverContext>) -> Self {
        Self {
            contexts: contexts
                .into_iter()
                .map(|ctx| (ctx.driver_id.clone(), ctx))
                .collect(),
        }
    }
}

#[async_trait]
impl DriverContextProvider for StaticContextProvider {
    async fn driver_context(&self, driver_id: &str) -> Result<DriverContext, ContextError> {
        self.contexts
            .get(driver_id)
            .cloned()
            .ok_or_else(|| ContextError::UnknownDriver(driver_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn contexts_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../contexts")
    }

    #[tokio::test]
    async fn loads_shipped_driver_context() {
        let provider = JsonFileContextProvider::new(contexts_dir());
        let ctx = provider.driver_context("driver-42").await.unwrap();
        assert_eq!(ctx.driver_id, "driver-42");
        assert_eq!(ctx.preferences.min_fare_minor, Some(1_000));
        assert_eq!(ctx.main_city.as_deref(), Some("Berlin"));
        assert_eq!(ctx.recommended_zones[0].name(), "mitte");
    }

    #[tokio::test]
    async fn unknown_and_unsafe_ids_are_rejected() {
        let provider = JsonFileContextProvider::new(contexts_dir());
        assert!(matches!(
            provider.driver_context("driver-0").await,
            Err(ContextError::UnknownDriver(_))
        ));
        assert!(matches!(
            provider.driver_context("../Cargo").await,
            Err(ContextError::InvalidDriverId(_))
        ));
    }

    #[tokio::test]
    async fn broken_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("d-1.json"), "{ not json").unwrap();
        let provider = JsonFileContextProvider::new(dir.path());
        assert!(matches!(
            provider.driver_context("d-1").await,
            Err(ContextError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn static_provider_serves_known_drivers() {
        let provider = StaticContextProvider::new([DriverContext::new("d-7")]);
        assert_eq!(provider.driver_context("d-7").await.unwrap().driver_id, "d-7");
        assert!(provider.driver_context("d-8").await.is_err());
    }
}
