use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("ROAR_LOG_LEVEL={directive:?} is not a valid tracing filter")]
    Filter {
        directive: String,
        #[source]
        source: ParseError,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Filter directive used when `RUST_LOG` is unset or unparsable.
fn fallback_directive(roar_log_level: Option<String>) -> String {
    roar_log_level
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn parse_filter(directive: String) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(&directive).map_err(|source| TelemetryError::Filter { directive, source })
}

/// Install the stderr subscriber. `RUST_LOG` wins over `ROAR_LOG_LEVEL`.
pub fn init() -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(fallback_directive(std::env::var("ROAR_LOG_LEVEL").ok()))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(TelemetryError::AlreadyInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_or_missing_level_falls_back_to_info() {
        assert_eq!(fallback_directive(None), "info");
        assert_eq!(fallback_directive(Some("  ".into())), "info");
        assert_eq!(fallback_directive(Some(" roar_engine=debug ".into())), "roar_engine=debug");
    }

    #[test]
    fn bad_directive_names_the_offending_value() {
        let Err(err) = parse_filter("roar_engine=loud".into()) else {
            panic!("invalid directive accepted");
        };
        assert!(matches!(err, TelemetryError::Filter { .. }));
        assert!(err.to_string().contains("roar_engine=loud"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
