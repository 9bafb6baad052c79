//! CLI command definitions for Cortex.
//!
//! `serve` wires the subsystems together and runs the HTTP front-end;
//! `migrate` applies the base schema and exits; `spawner` is the
//! interactive operator picker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::config::CortexConfig;
use crate::decisions::ttl::TtlReaper;
use crate::decisions::writer::DecisionWriter;
use crate::extractor::dispatcher::ExtractorRuntime;
use crate::extractor::plugin::{FeatureExtractor, SqlFeatureExtractor};
use crate::identity::{IdentityClient, IdentityConfig};
use crate::metrics::init_metrics;
use crate::metrics::kpis::KpiCollector;
use crate::scheduling::definition::{ExtractorConfig, PipelineFile};
use crate::scheduling::reloader::PipelineReloader;
use crate::scheduling::step::StepHandles;
use crate::scheduling::steps::builtin_registry;
use crate::server::{router, AppState};
use crate::store::feature::{FeatureStore, TableSpec};
use crate::store::migrations::MigrationRunner;
use crate::store::resources::{PgResourceStore, Resource, ResourceKind, ResourceStore};

use super::spawner::{self, SpawnerArgs};

/// External scheduling advisor for heterogeneous cloud placement.
#[derive(Parser)]
#[command(name = "cortex")]
#[command(about = "External scheduling advisor: ranks candidate hosts for upstream schedulers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the advisor: HTTP front-end, extractor dispatcher, descheduler,
    /// decision writer, and TTL reaper.
    Serve(ServeArgs),

    /// Apply the base database schema and exit.
    Migrate,

    /// Interactively pick AZ, domain, project, flavor, image, and
    /// hypervisor; remembers the last selection.
    Spawner(SpawnerArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Override the pipeline definitions file from the environment config.
    #[arg(long)]
    pub pipelines_file: Option<std::path::PathBuf>,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses the command line and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Migrate => migrate().await,
        Commands::Spawner(args) => spawner::run(args),
    }
}

/// Applies the base schema.
async fn migrate() -> anyhow::Result<()> {
    let config = CortexConfig::from_env().context("loading configuration")?;
    let store = FeatureStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    MigrationRunner::new(store.pool().clone())
        .run_migrations()
        .await
        .context("running migrations")?;
    info!("Migrations applied");
    Ok(())
}

/// Builds SQL extractors from their file declarations.
fn build_extractors(configs: &[ExtractorConfig]) -> Vec<Box<dyn FeatureExtractor>> {
    configs
        .iter()
        .map(|config| {
            let mut table = TableSpec::new(&config.table)
                .with_recency_window(Duration::from_secs(config.recency_window_secs));
            for column in &config.columns {
                table = table.with_column(&column.name, &column.sql_type);
            }
            for index in &config.indexes {
                table = table.with_index(index);
            }

            let mut extractor = SqlFeatureExtractor::new(&config.name, table, &config.query);
            for trigger in &config.triggers {
                extractor = extractor.with_trigger(trigger);
            }
            Box::new(extractor) as Box<dyn FeatureExtractor>
        })
        .collect()
}

/// Runs the advisor until SIGINT.
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = CortexConfig::from_env().context("loading configuration")?;
    if let Some(path) = args.pipelines_file {
        config.pipeline_defs_path = path;
    }

    // Identity credentials are required even though tokens are only
    // fetched on demand; a missing variable aborts startup.
    let identity_config = IdentityConfig::from_env().context("loading identity configuration")?;
    info!(auth_url = %identity_config.auth_url, "Identity configured");
    let _identity = IdentityClient::new(identity_config);

    init_metrics().context("initializing metrics")?;

    let features = FeatureStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    MigrationRunner::new(features.pool().clone())
        .run_migrations()
        .await
        .context("running migrations")?;
    let resources: Arc<dyn ResourceStore> =
        Arc::new(PgResourceStore::new(features.pool().clone()));

    let bus = Arc::new(
        MessageBus::connect(&config.bus_url, config.bus_max_attempts)
            .await
            .context("connecting to message bus")?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Decision path: TTL reaper plus the bounded writer feeding it.
    let (reaper_handle, reaper) = TtlReaper::new(Arc::clone(&resources), config.decision_ttl);
    let (decision_sink, decision_writer) = DecisionWriter::new(
        Arc::clone(&resources),
        config.decision_queue_capacity,
        config.decision_ttl,
        config.decision_payload_limit,
        Some(reaper_handle),
    );
    tokio::spawn(reaper.run(shutdown_tx.subscribe()));
    tokio::spawn(decision_writer.run(shutdown_tx.subscribe()));

    // Pipelines: startup definitions from the YAML file, seeded into the
    // resource store so the reloader keeps serving them.
    let file = match PipelineFile::load(&config.pipeline_defs_path) {
        Ok(file) => file,
        Err(e) => {
            warn!(
                path = %config.pipeline_defs_path.display(),
                error = %e,
                "No usable pipeline definitions file, starting empty"
            );
            PipelineFile::default()
        }
    };

    for definition in &file.pipelines {
        let existing = resources
            .get(ResourceKind::Pipeline, &definition.name)
            .await?;
        if existing.is_none() {
            resources
                .put(Resource::new(
                    ResourceKind::Pipeline,
                    definition.name.clone(),
                    definition.to_resource_spec(),
                ))
                .await?;
        }
    }

    let reloader = Arc::new(PipelineReloader::new(
        builtin_registry(),
        StepHandles::with_features(features.clone()),
        Some(Arc::clone(&bus)),
        Some(decision_sink),
        Some(Arc::clone(&resources)),
    ));
    reloader.apply(&file.pipelines).await;
    tokio::spawn(Arc::clone(&reloader).run(config.reload_interval, shutdown_tx.subscribe()));

    // Extractors and their KPI registration.
    let mut kpis = KpiCollector::new(features.clone());
    for extractor_config in &file.extractors {
        let table = TableSpec::new(&extractor_config.table);
        kpis.register_table(
            table.name,
            Duration::from_secs(extractor_config.recency_window_secs),
        );
    }

    let extractors = build_extractors(&file.extractors);
    let extractor_runtime = Arc::new(
        ExtractorRuntime::new(
            extractors,
            features.clone(),
            Arc::clone(&bus),
            config.extractor_workers,
        )
        .await
        .context("initializing extractors")?,
    );
    {
        let shutdown_rx = shutdown_tx.subscribe();
        let runtime = Arc::clone(&extractor_runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.run(shutdown_rx).await {
                warn!(error = %e, "Extractor dispatcher exited");
            }
        });
    }

    // HTTP front-end.
    let state = AppState {
        reloader,
        kpis: Some(Arc::new(kpis)),
        request_timeout: config.request_timeout,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_listen)
        .await
        .with_context(|| format!("binding {}", config.http_listen))?;
    info!(listen = %config.http_listen, "Cortex serving");

    let shutdown = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown.send(());
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::definition::ColumnConfig;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::parse_from(["cortex", "serve"]);
        assert!(matches!(cli.command, Commands::Serve(_)));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_parses_migrate_with_log_level() {
        let cli = Cli::parse_from(["cortex", "--log-level", "debug", "migrate"]);
        assert!(matches!(cli.command, Commands::Migrate));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_build_extractors_from_config() {
        let configs = vec![ExtractorConfig {
            name: "host_utilization".to_string(),
            table: "host_utilization".to_string(),
            columns: vec![
                ColumnConfig {
                    name: "host".to_string(),
                    sql_type: "TEXT NOT NULL".to_string(),
                },
                ColumnConfig {
                    name: "cpu_headroom".to_string(),
                    sql_type: "DOUBLE PRECISION NOT NULL".to_string(),
                },
            ],
            indexes: vec!["host".to_string()],
            recency_window_secs: 300,
            query: "SELECT host, 1.0 - cpu_usage FROM raw_host_metrics".to_string(),
            triggers: vec!["data/host_metrics/synced".to_string()],
        }];

        let extractors = build_extractors(&configs);
        assert_eq!(extractors.len(), 1);
        assert_eq!(extractors[0].name(), "host_utilization");
        assert_eq!(extractors[0].table().name, "feature_host_utilization");
        assert_eq!(
            extractors[0].triggers(),
            vec!["data/host_metrics/synced".to_string()]
        );
    }
}
