//! usermetrics-cli - one-shot front end for the metric pipeline
//!
//! Resolves cohorts, serves metric requests given as canonical routes
//! (`/metrics/<cohort>/<metric>?t=...`) through the signature cache, and runs
//! ad-hoc warehouse queries.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use usermetrics_common::cache::route_from_keys;
use usermetrics_common::cohort::CohortSource;
use usermetrics_common::config::{resolve_database_path, ConfigResolver, TomlConfig};
use usermetrics_common::db::{RowSource, Warehouse};
use usermetrics_common::request::{apply_defaults, restrict_to_metric};
use usermetrics_common::{
    BatchExecutor, CohortResolver, MemberLookup, MetricPipeline, RequestSignature, Served,
    SignatureCache, SignatureSchema,
};

mod metrics;

use metrics::{EditCount, EditCountArgs, MetricResult, Threshold, ThresholdArgs};

/// Command-line arguments for usermetrics-cli
#[derive(Parser, Debug)]
#[command(name = "usermetrics-cli")]
#[command(about = "Cohort metrics over the wiki-edit warehouse")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Warehouse SQLite database
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Concurrent workers per batch (0 or 1 = sequential)
    #[arg(short, long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a cohort expression (e.g. `1&2~3`) or tag name
    Resolve { cohort: String },

    /// Serve metric requests; repeated requests are answered from the cache
    Run {
        #[arg(required = true)]
        routes: Vec<String>,
    },

    /// Run an ad-hoc query and print its rows
    Query { sql: String },
}

type Pipeline = MetricPipeline<Warehouse, MetricResult>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before tracing starts so its log level can apply
    let (config, config_error) = match ConfigResolver::new(args.config.clone()).load() {
        Ok(config) => (config, None),
        Err(e) => (TomlConfig::default(), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting usermetrics-cli v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!("Config not loaded ({}), using defaults", e);
    }

    let db_path = resolve_database_path(args.database.as_deref(), &config);
    info!("Warehouse path: {}", db_path.display());

    let warehouse = Warehouse::connect(&db_path)
        .await
        .context("Failed to open warehouse database")?;

    match args.command {
        Command::Resolve { cohort } => resolve(warehouse, &cohort).await,
        Command::Run { routes } => {
            let worker_count = args.workers.unwrap_or(config.executor.worker_count);
            run(warehouse, worker_count, &config.cache.route_root, &routes).await
        }
        Command::Query { sql } => query(&warehouse, &sql).await,
    }
}

async fn resolve(warehouse: Warehouse, cohort: &str) -> Result<()> {
    let resolver = CohortResolver::new(warehouse);
    let resolution = resolver
        .resolve_with_source(cohort)
        .await
        .with_context(|| format!("Failed to resolve cohort {:?}", cohort))?;

    match &resolution.source {
        CohortSource::Expression(expr) => info!("Resolved expression {}", expr),
        CohortSource::Tag { name, id } => {
            let refreshed = resolver.lookup().refreshed_at(*id).await?;
            info!(
                "Resolved tag {} (id {}), last refreshed {:?}",
                name, id, refreshed
            );
        }
    }

    for subject in resolution.subjects.iter() {
        println!("{}", subject);
    }
    Ok(())
}

async fn run(
    warehouse: Warehouse,
    worker_count: usize,
    route_root: &str,
    routes: &[String],
) -> Result<()> {
    let schema = SignatureSchema::metrics_api();
    let cache = Arc::new(SignatureCache::new(schema.clone()));
    let handles = Arc::new(warehouse.clone());
    let pipeline: Pipeline =
        MetricPipeline::new(warehouse, BatchExecutor::new(worker_count), Arc::clone(&cache));
    let now = chrono::Local::now().naive_local();

    for route in routes {
        let parsed = RequestSignature::from_route(&schema, route, route_root)
            .with_context(|| format!("Bad request route {:?}", route))?;
        let mut signature = restrict_to_metric(&parsed)?;
        apply_defaults(&mut signature, now)?;

        let served = serve(&pipeline, &signature, &handles).await?;
        let canonical = route_from_keys(&schema, &schema.key_path(&signature)?, route_root)?;

        let output = serde_json::json!({
            "route": canonical,
            "cached": served.is_cached(),
            "result": served.value(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    info!("Cache holds {} entries", cache.len().await);
    Ok(())
}

async fn serve(
    pipeline: &Pipeline,
    signature: &RequestSignature,
    handles: &Arc<Warehouse>,
) -> Result<Served<MetricResult>> {
    let served = match signature.present("metric") {
        Some("edit_count") => {
            let args = EditCountArgs::from_signature(signature)?;
            pipeline
                .serve(signature, Arc::new(EditCount), Arc::new(args), Arc::clone(handles), |data| {
                    MetricResult::new("edit_count", EditCount::HEADER.to_vec(), data)
                })
                .await?
        }
        Some("threshold") => {
            let args = ThresholdArgs::from_signature(signature)?;
            pipeline
                .serve(signature, Arc::new(Threshold), Arc::new(args), Arc::clone(handles), |data| {
                    MetricResult::new("threshold", Threshold::HEADER.to_vec(), data)
                })
                .await?
        }
        Some(other) => bail!("Metric '{}' is not computed by this tool", other),
        None => bail!("Request has no metric"),
    };
    Ok(served)
}

async fn query(warehouse: &Warehouse, sql: &str) -> Result<()> {
    let rows = warehouse.query_rows(sql).await.context("Query failed")?;
    for row in &rows {
        let fields: Vec<&str> = row
            .iter()
            .map(|field| field.as_deref().unwrap_or("NULL"))
            .collect();
        println!("{}", fields.join("\t"));
    }
    info!("{} rows", rows.len());
    Ok(())
}
