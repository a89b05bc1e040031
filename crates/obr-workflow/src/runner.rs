//! Workflow runner: drives each resource through the three stages in order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use obr_core::{defaults, AnnotationStore, Error, ObrWeight, OntologyRelations, RetryPolicy, Stage};

use crate::aggregator::Aggregator;
use crate::expander::Expander;
use crate::handler::{StageContext, StageHandler, StageReport, StageResult};

/// Configuration for the workflow runner.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Rows read per batch.
    pub batch_size: i64,
    /// Resources processed at the same time.
    pub max_concurrent_resources: usize,
    /// Time budget for one stage over one resource.
    pub stage_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            max_concurrent_resources: defaults::MAX_CONCURRENT_RESOURCES,
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `OBR_BATCH_SIZE` | `5000` | Rows read and committed per batch |
    /// | `OBR_MAX_CONCURRENT_RESOURCES` | `2` | Resources run in parallel |
    /// | `OBR_STAGE_TIMEOUT_SECS` | `3600` | Per-stage time budget |
    ///
    /// The retry policy is read by [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let batch_size = std::env::var("OBR_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults::BATCH_SIZE);

        let max_concurrent_resources = std::env::var("OBR_MAX_CONCURRENT_RESOURCES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::MAX_CONCURRENT_RESOURCES)
            .max(1);

        let stage_timeout_secs = std::env::var("OBR_STAGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults::STAGE_TIMEOUT_SECS);

        Self {
            batch_size,
            max_concurrent_resources,
            stage_timeout: Duration::from_secs(stage_timeout_secs),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_resources = max.max(1);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Event emitted by the workflow runner.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    RunnerStarted { resources: usize },
    ResourceStarted { resource_id: String },
    /// A stage committed a batch.
    StageProgress {
        resource_id: String,
        stage: Stage,
        batch: u64,
        rows: u64,
    },
    StageCompleted {
        resource_id: String,
        stage: Stage,
        report: StageReport,
    },
    StageFailed {
        resource_id: String,
        stage: Stage,
        error: String,
    },
    ResourceCompleted { resource_id: String, success: bool },
    RunnerStopped,
}

/// Outcome of one resource's run.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceReport {
    pub resource_id: String,
    /// Reports of the stages that completed, in order.
    pub stages: Vec<StageReport>,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ResourceReport {
    fn started(resource_id: &str) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.to_string(),
            stages: Vec::new(),
            failed_stage: None,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == Some(stage))
    }
}

/// Outcome of a runner invocation, one entry per distinct resource in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowReport {
    pub resources: Vec<ResourceReport>,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.resources.iter().all(ResourceReport::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources.iter().filter(|r| !r.is_success())
    }

    pub fn resource(&self, resource_id: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }
}

type HandlerMap = Arc<HashMap<Stage, Arc<dyn StageHandler>>>;

/// Runs resources through the pipeline stages.
pub struct WorkflowRunner {
    config: WorkflowConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkflowEvent>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkflowRunner {
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Get a receiver for workflow events.
    pub fn events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Run every stage for each resource.
    ///
    /// Different resources run concurrently up to `max_concurrent_resources`;
    /// duplicate ids are collapsed. A failed stage stops its resource only.
    #[instrument(skip(self), fields(subsystem = "workflow", component = "runner"))]
    pub async fn run(&self, resource_ids: &[String]) -> WorkflowReport {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = resource_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        info!(
            resources = distinct.len(),
            max_concurrent = self.config.max_concurrent_resources,
            "Workflow runner started"
        );
        let _ = self.event_tx.send(WorkflowEvent::RunnerStarted {
            resources: distinct.len(),
        });

        let mut slots: Vec<Option<ResourceReport>> = vec![None; distinct.len()];
        let mut tasks = tokio::task::JoinSet::new();
        let mut pending = distinct.iter().cloned().enumerate();

        loop {
            while tasks.len() < self.config.max_concurrent_resources {
                let Some((index, resource_id)) = pending.next() else {
                    break;
                };
                let runner = self.clone_refs();
                tasks.spawn(async move { (index, runner.run_resource(resource_id).await) });
            }

            match tasks.join_next().await {
                Some(Ok((index, report))) => slots[index] = Some(report),
                Some(Err(e)) => error!(error = ?e, "Resource task panicked"),
                None => break,
            }
        }

        let resources: Vec<ResourceReport> = slots
            .into_iter()
            .zip(distinct)
            .map(|(slot, resource_id)| {
                slot.unwrap_or_else(|| {
                    let mut report = ResourceReport::started(&resource_id);
                    report.error = Some("resource task aborted".into());
                    report
                })
            })
            .collect();

        let _ = self.event_tx.send(WorkflowEvent::RunnerStopped);
        info!(
            resources = resources.len(),
            failed = resources.iter().filter(|r| !r.is_success()).count(),
            "Workflow runner stopped"
        );
        WorkflowReport { resources }
    }

    /// Run every stage for a single resource.
    pub async fn run_resource(&self, resource_id: &str) -> ResourceReport {
        self.clone_refs().run_resource(resource_id.to_string()).await
    }

    /// Clone references needed for spawned resource tasks.
    fn clone_refs(&self) -> RunnerRef {
        RunnerRef {
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            active: self.active.clone(),
        }
    }
}

/// Marks a resource as running; released on drop.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    resource_id: String,
}

impl ActiveGuard {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, resource_id: &str) -> Option<Self> {
        let inserted = match active.lock() {
            Ok(mut set) => set.insert(resource_id.to_string()),
            Err(_) => false,
        };
        inserted.then(|| Self {
            active: active.clone(),
            resource_id: resource_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.active.lock() {
            set.remove(&self.resource_id);
        }
    }
}

/// Lightweight reference bundle for running one resource in a spawned task.
struct RunnerRef {
    config: WorkflowConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkflowEvent>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunnerRef {
    async fn run_resource(self, resource_id: String) -> ResourceReport {
        let start = Instant::now();
        let mut report = ResourceReport::started(&resource_id);

        let Some(_guard) = ActiveGuard::acquire(&self.active, &resource_id) else {
            warn!(%resource_id, "Resource is already running, skipping");
            report.error = Some(format!("resource {} is already running", resource_id));
            report.finished_at = Utc::now();
            return report;
        };

        info!(%resource_id, "Processing resource");
        let _ = self.event_tx.send(WorkflowEvent::ResourceStarted {
            resource_id: resource_id.clone(),
        });

        for stage in Stage::ORDER {
            match self.run_stage(&resource_id, stage).await {
                StageResult::Success(stage_report) => {
                    info!(
                        %resource_id,
                        %stage,
                        count = stage_report.count(),
                        duration_ms = stage_report.duration_ms,
                        "Stage completed"
                    );
                    let _ = self.event_tx.send(WorkflowEvent::StageCompleted {
                        resource_id: resource_id.clone(),
                        stage,
                        report: stage_report.clone(),
                    });
                    report.stages.push(stage_report);
                }
                StageResult::Failed(error) => {
                    warn!(%resource_id, %stage, %error, "Stage failed, stopping resource");
                    let _ = self.event_tx.send(WorkflowEvent::StageFailed {
                        resource_id: resource_id.clone(),
                        stage,
                        error: error.clone(),
                    });
                    report.failed_stage = Some(stage);
                    report.error = Some(error);
                    break;
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            %resource_id,
            success = report.is_success(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Resource finished"
        );
        let _ = self.event_tx.send(WorkflowEvent::ResourceCompleted {
            resource_id,
            success: report.is_success(),
        });
        report
    }

    async fn run_stage(&self, resource_id: &str, stage: Stage) -> StageResult {
        let Some(handler) = self.handlers.get(&stage).cloned() else {
            warn!(%stage, "No handler registered for stage");
            return StageResult::Failed(format!("No handler for stage: {}", stage));
        };

        let event_tx = self.event_tx.clone();
        let progress_resource = resource_id.to_string();
        let ctx = StageContext::new(resource_id)
            .with_batch_size(self.config.batch_size)
            .with_retry(self.config.retry.clone())
            .with_progress_callback(move |batch, rows| {
                let _ = event_tx.send(WorkflowEvent::StageProgress {
                    resource_id: progress_resource.clone(),
                    stage,
                    batch,
                    rows,
                });
            });

        debug!(%resource_id, %stage, "Starting stage");
        // Dropping a timed-out stage rolls back its in-flight batch transaction.
        match tokio::time::timeout(self.config.stage_timeout, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let error = Error::Timeout(format!(
                    "{} exceeded {}s",
                    stage,
                    self.config.stage_timeout.as_secs()
                ));
                StageResult::Failed(error.to_string())
            }
        }
    }
}

/// Builder for creating a workflow runner with its stage handlers.
pub struct WorkflowBuilder {
    store: Arc<dyn AnnotationStore>,
    relations: Arc<dyn OntologyRelations>,
    config: WorkflowConfig,
    weights: ObrWeight,
    handlers: Vec<Box<dyn StageHandler>>,
}

impl WorkflowBuilder {
    pub fn new(store: Arc<dyn AnnotationStore>, relations: Arc<dyn OntologyRelations>) -> Self {
        Self {
            store,
            relations,
            config: WorkflowConfig::default(),
            weights: ObrWeight::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_weights(mut self, weights: ObrWeight) -> Self {
        self.weights = weights;
        self
    }

    /// Replace the default handler for the handler's stage.
    pub fn with_handler<H: StageHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Build and return the runner.
    pub fn build(self) -> WorkflowRunner {
        let mut handlers: HashMap<Stage, Arc<dyn StageHandler>> = HashMap::new();
        handlers.insert(
            Stage::IsaClosure,
            Arc::new(Expander::isa_closure(
                self.store.clone(),
                self.relations.clone(),
            )),
        );
        handlers.insert(
            Stage::Mapping,
            Arc::new(Expander::mapping(self.store.clone(), self.relations.clone())),
        );
        handlers.insert(
            Stage::Aggregation,
            Arc::new(Aggregator::new(self.store.clone(), self.weights)),
        );
        for handler in self.handlers {
            let stage = handler.stage();
            debug!(%stage, "Registered stage handler");
            handlers.insert(stage, Arc::from(handler));
        }

        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        WorkflowRunner {
            config: self.config,
            handlers: Arc::new(handlers),
            event_tx,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_config_default() {
        let config = WorkflowConfig::default();
        assert_eq!(config.batch_size, 5_000);
        assert_eq!(config.max_concurrent_resources, 2);
        assert_eq!(config.stage_timeout, Duration::from_secs(3_600));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_workflow_config_builder() {
        let config = WorkflowConfig::default()
            .with_batch_size(100)
            .with_max_concurrent(0)
            .with_stage_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::no_retry());

        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_concurrent_resources, 1);
        assert_eq!(config.stage_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_active_guard_excludes_second_run() {
        let active = Arc::new(Mutex::new(HashSet::new()));
        let first = ActiveGuard::acquire(&active, "GEO");
        assert!(first.is_some());
        assert!(ActiveGuard::acquire(&active, "GEO").is_none());
        assert!(ActiveGuard::acquire(&active, "PubMed").is_some());
        drop(first);
        assert!(ActiveGuard::acquire(&active, "GEO").is_some());
    }

    #[test]
    fn test_workflow_report_success() {
        let ok = ResourceReport::started("A");
        let mut failed = ResourceReport::started("B");
        failed.error = Some("boom".into());
        failed.failed_stage = Some(Stage::Mapping);

        let report = WorkflowReport {
            resources: vec![ok, failed],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed().count(), 1);
        assert!(report.resource("A").unwrap().is_success());
    }
}
