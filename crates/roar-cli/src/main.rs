use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roar_core::DriverContext;
use roar_engine::{
    build_scheduler, load_aggregation_config, load_source_registry, pipeline_from_settings, DriverContextProvider,
    EngineSettings,
};
use tracing::info;

mod telemetry;

#[derive(Debug, Parser)]
#[command(name = "roar-cli")]
#[command(about = "Ride offer aggregation and recommendation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate aggregation.yaml and sources.yaml.
    CheckConfig,
    /// Run one cycle and print the ranked recommendations as JSON.
    Recommend {
        /// Driver context JSON file.
        #[arg(long, conflicts_with = "driver")]
        context: Option<PathBuf>,
        /// Driver id looked up in the contexts directory.
        #[arg(long)]
        driver: Option<String>,
    },
    /// Serve the HTTP API.
    Serve,
    /// Run a cycle per cron tick for one driver until interrupted.
    Watch {
        #[arg(long)]
        driver: String,
        /// Overrides ROAR_CYCLE_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    let settings = EngineSettings::from_env();

    match cli.command.unwrap_or(Commands::CheckConfig) {
        Commands::CheckConfig => check_config(&settings).await?,
        Commands::Recommend { context, driver } => {
            let ctx = match (context, driver) {
                (Some(path), _) => read_context(&path).await?,
                (None, Some(driver_id)) => settings.context_provider().driver_context(&driver_id).await?,
                (None, None) => anyhow::bail!("pass --context <file> or --driver <id>"),
            };
            let pipeline = pipeline_from_settings(&settings).await?;
            let outcome = pipeline.run_cycle_and_flush(&ctx).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Serve => roar_web::serve_from_env().await?,
        Commands::Watch { driver, cron } => {
            let cron = cron.unwrap_or_else(|| settings.cycle_cron.clone());
            let pipeline = Arc::new(pipeline_from_settings(&settings).await?);
            let provider: Arc<dyn DriverContextProvider> = Arc::new(settings.context_provider());
            let mut sched = build_scheduler(pipeline, provider, driver.clone(), &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%driver, %cron, "watching; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn check_config(settings: &EngineSettings) -> Result<()> {
    let config_path = settings.resolve(&settings.config_path);
    let sources_path = settings.resolve(&settings.sources_path);
    let config = load_aggregation_config(&config_path).await?;
    let registry = load_source_registry(&sources_path).await?;

    println!("config ok: {}", config_path.display());
    for source in &config.sources {
        let transport = registry
            .sources
            .iter()
            .find(|entry| entry.source_id == source.source_id)
            .map(|entry| format!("{:?}", entry.transport))
            .unwrap_or_else(|| "no registry entry".to_string());
        println!(
            "- {} priority={} desirability={} commission={} enabled={} transport={}",
            source.source_id, source.priority, source.desirability, source.commission_rate, source.enabled, transport
        );
    }
    Ok(())
}

async fn read_context(path: &Path) -> Result<DriverContext> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn recommend_accepts_context_or_driver_but_not_both() {
        let cli = Cli::try_parse_from(["roar-cli", "recommend", "--driver", "driver-42"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Recommend { driver: Some(_), context: None })));

        let both = Cli::try_parse_from(["roar-cli", "recommend", "--driver", "d", "--context", "c.json"]);
        assert!(both.is_err());
    }

    #[test]
    fn no_subcommand_defaults_to_config_check() {
        let cli = Cli::try_parse_from(["roar-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
