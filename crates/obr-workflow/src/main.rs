//! obr-workflow: runs the post-tagging annotation pipeline against PostgreSQL.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use obr_db::{
    log_pool_metrics, ConceptRef, Database, DirectAnnotationRepository, MaintenanceRepository,
    ObrWeight, PgAnnotationStore, PgOntologyRelations, PoolConfig, ResourceRepository,
    ScoreRepository,
};
use obr_workflow::{
    Aggregator, Expander, StageContext, StageReport, WorkflowBuilder, WorkflowConfig,
    WorkflowEvent,
};

#[derive(Parser)]
#[command(name = "obr-workflow")]
#[command(author, version, about = "Ontology-based annotation workflow")]
#[command(propagate_version = true)]
struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run is-a closure, mapping, and aggregation for resources
    Run {
        /// Resource ids (can specify multiple)
        #[arg(short, long, num_args = 1.., required_unless_present = "all")]
        resource: Vec<String>,

        /// Run every registered resource
        #[arg(long)]
        all: bool,
    },

    /// Expand direct annotations along the is-a closure
    IsaClosure { resource: String },

    /// Expand direct annotations along cross-ontology mappings
    Mapping { resource: String },

    /// Aggregate annotations into the score index
    Aggregate { resource: String },

    /// Delete every annotation and score of one or more ontologies
    DeleteOntology {
        #[arg(required = true, num_args = 1..)]
        ontology: Vec<String>,
    },

    /// Delete a resource with all of its elements, annotations, and scores
    DeleteResource { resource: String },

    /// Show workflow status counts and per-ontology statistics
    Stats { resource: String },

    /// Show aggregated scores for an element or a concept
    Scores {
        /// Resource of the element
        #[arg(short, long, requires = "element")]
        resource: Option<String>,

        /// Local element id
        #[arg(short, long)]
        element: Option<String>,

        /// Concept as ontology/code
        #[arg(short, long, conflicts_with = "element")]
        concept: Option<String>,

        /// Maximum hits for a concept query
        #[arg(short, long, default_value_t = obr_db::defaults::SCORE_QUERY_LIMIT)]
        limit: i64,
    },

    /// Apply pending database migrations
    Migrate,
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "obr_workflow=info,obr_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "obr_workflow=info,obr_db=info,obr_core=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("obr-workflow.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn stage_context(resource: &str, config: &WorkflowConfig) -> StageContext {
    StageContext::new(resource)
        .with_batch_size(config.batch_size)
        .with_retry(config.retry.clone())
}

fn print_stage(report: &StageReport) -> anyhow::Result<()> {
    print_json(report)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "postgres://localhost/obr".to_string());

    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("connecting to database")?;

    let config = WorkflowConfig::from_env();
    let weights = ObrWeight::from_env();
    weights.validate()?;

    let store = Arc::new(PgAnnotationStore::new(db.pool.clone()));
    let relations = Arc::new(PgOntologyRelations::new(db.pool.clone()));

    match cli.command {
        Commands::Run { resource, all } => {
            let resources = if all {
                db.resources
                    .list_resources()
                    .await?
                    .into_iter()
                    .map(|r| r.resource_id)
                    .collect()
            } else {
                resource
            };

            let runner = WorkflowBuilder::new(store, relations)
                .with_config(config)
                .with_weights(weights)
                .build();

            let mut events = runner.events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let WorkflowEvent::StageProgress {
                        resource_id,
                        stage,
                        batch,
                        rows,
                    } = event
                    {
                        tracing::debug!(%resource_id, %stage, batch, rows, "Batch committed");
                    }
                }
            });

            let report = tokio::select! {
                report = runner.run(&resources) => report,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; in-flight batches are rolled back");
                    return Ok(ExitCode::from(130));
                }
            };
            log_pool_metrics(db.pool());
            print_json(&report)?;
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::IsaClosure { resource } => {
            let report = Expander::isa_closure(store, relations)
                .expand(&stage_context(&resource, &config))
                .await?;
            print_stage(&report)?;
        }
        Commands::Mapping { resource } => {
            let report = Expander::mapping(store, relations)
                .expand(&stage_context(&resource, &config))
                .await?;
            print_stage(&report)?;
        }
        Commands::Aggregate { resource } => {
            let report = Aggregator::new(store, weights)
                .aggregate(&stage_context(&resource, &config))
                .await?;
            print_stage(&report)?;
        }
        Commands::DeleteOntology { ontology } => {
            let deleted = db.maintenance.delete_ontologies(&ontology).await?;
            print_json(&serde_json::json!({ "ontologies": ontology, "deleted": deleted }))?;
        }
        Commands::DeleteResource { resource } => {
            let deleted = db.maintenance.delete_resource(&resource).await?;
            print_json(&serde_json::json!({ "resource": resource, "deleted": deleted }))?;
        }
        Commands::Stats { resource } => {
            let counts = db.direct_annotations.status_counts(&resource).await?;
            let ontologies = db.scores.ontology_statistics(&resource).await?;
            print_json(&serde_json::json!({
                "resource": resource,
                "status": counts,
                "ontologies": ontologies,
            }))?;
        }
        Commands::Scores {
            resource,
            element,
            concept,
            limit,
        } => match (resource, element, concept) {
            (Some(resource), Some(element), None) => {
                print_json(&db.scores.scores_for_element(&resource, &element).await?)?;
            }
            (_, None, Some(concept)) => {
                let concept: ConceptRef = concept.parse()?;
                print_json(&db.scores.scores_for_concept(&concept, limit).await?)?;
            }
            _ => anyhow::bail!("pass --resource with --element, or --concept"),
        },
        Commands::Migrate => {
            db.migrate().await.context("running migrations")?;
            info!("Migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "obr-workflow failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
