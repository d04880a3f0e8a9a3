//! The engine: binds a graph, spawns one worker per stage copy, joins the
//! run and reports the outcome.

#[cfg(test)]
mod integration_tests;

use crate::errors::{EngineError, WiringError};
use crate::log::{LogLevel, LogSink, TracingLogSink};
use crate::queue::Endpoint;
use crate::stage::Transform;
use crate::topology::{GraphDefinition, TopologyBinder};
use crate::worker::{StageWorker, StopFlag, WorkerMonitor, WorkerStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Default capacity of every queue in the bound topology.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Creates the transform of one stage copy.
///
/// Called once per copy, in ascending copy order.
pub type TransformFactory = Box<dyn Fn() -> Box<dyn Transform> + Send + Sync>;

/// The outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Unique identifier of the run.
    pub run_id: Uuid,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// When the last worker retired.
    pub finished_at: DateTime<Utc>,
    /// Final status of every worker, ordered by stage then copy.
    pub workers: Vec<WorkerStatus>,
    /// Fatal errors raised by workers, in completion order.
    pub errors: Vec<EngineError>,
    /// The first stop reason, when the run was stopped.
    pub stop_reason: Option<String>,
}

impl RunReport {
    /// Returns true when every worker finished without a fatal error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Looks up the final status of one stage copy.
    #[must_use]
    pub fn worker(&self, stage: &str, copy: usize) -> Option<&WorkerStatus> {
        self.workers
            .iter()
            .find(|w| w.endpoint.stage == stage && w.endpoint.copy == copy)
    }
}

/// Drives one run of a stage graph.
///
/// Configure with the builder methods, register a [`TransformFactory`] per
/// stage, then [`run`](Engine::run). Worker status can be observed through
/// [`worker_status`](Engine::worker_status) while the run is in flight, and
/// [`request_stop`](Engine::request_stop) asks every worker to wind down
/// cooperatively.
pub struct Engine {
    graph: GraphDefinition,
    factories: HashMap<String, TransformFactory>,
    queue_capacity: usize,
    safe_mode: bool,
    log: Arc<dyn LogSink>,
    registry: DashMap<Endpoint, Arc<WorkerMonitor>>,
    stop: Arc<StopFlag>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.graph.stages.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("safe_mode", &self.safe_mode)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine for a graph, logging through tracing by default.
    #[must_use]
    pub fn new(graph: GraphDefinition) -> Self {
        Self {
            graph,
            factories: HashMap::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            safe_mode: false,
            log: Arc::new(TracingLogSink::default()),
            registry: DashMap::new(),
            stop: Arc::new(StopFlag::new()),
        }
    }

    /// Registers the transform factory of one stage.
    #[must_use]
    pub fn with_transform(
        mut self,
        stage: impl Into<String>,
        factory: impl Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(stage.into(), Box::new(factory));
        self
    }

    /// Overrides the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Enables per-row shape validation on every stage.
    #[must_use]
    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// Replaces the log sink.
    #[must_use]
    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    /// The run's stop flag.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<StopFlag> {
        Arc::clone(&self.stop)
    }

    /// Asks every worker to stop cooperatively.
    pub fn request_stop(&self, reason: impl Into<String>) {
        self.stop.trigger(reason);
    }

    /// Returns a snapshot of every worker, ordered by stage then copy.
    #[must_use]
    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .registry
            .iter()
            .map(|entry| entry.value().status(entry.key()))
            .collect();
        statuses.sort_by(|a, b| {
            a.endpoint
                .stage
                .cmp(&b.endpoint.stage)
                .then(a.endpoint.copy.cmp(&b.endpoint.copy))
        });
        statuses
    }

    /// Runs the graph to completion.
    ///
    /// Binds the topology, initializes every worker, then spawns them all
    /// and joins. Wiring and init failures abort before any row moves and
    /// are returned as `Err`; worker-fatal errors during the run stop the
    /// remaining workers and are collected in the report instead.
    ///
    /// Each call starts fresh: the status registry and the stop flag are
    /// cleared, so a stop requested during one run does not leak into the
    /// next.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.registry.clear();
        self.stop.reset();
        self.log.log(
            LogLevel::Basic,
            "engine",
            &format!(
                "run {run_id} starting ({} stages, {} workers)",
                self.graph.stages.len(),
                self.graph.total_copies()
            ),
        );

        let binder = TopologyBinder::new(self.queue_capacity);
        let mut topology = binder.bind(&self.graph, self.log.as_ref())?;

        let mut workers = Vec::with_capacity(self.graph.total_copies());
        for stage in &self.graph.stages {
            let factory = self.factories.get(&stage.name).ok_or_else(|| {
                WiringError::new(format!(
                    "no transform registered for stage '{}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
            })?;
            for copy in 0..stage.effective_copies() {
                let endpoint = Endpoint::new(&stage.name, copy);
                let bindings = topology.take_bindings(&endpoint).unwrap_or_default();
                let monitor = Arc::new(WorkerMonitor::new());
                self.registry.insert(endpoint.clone(), Arc::clone(&monitor));
                workers.push(StageWorker::new(
                    endpoint,
                    (factory)(),
                    bindings,
                    stage,
                    self.safe_mode,
                    monitor,
                    Arc::clone(&self.stop),
                    Arc::clone(&self.log),
                ));
            }
        }

        let initialized = self.initialize_all(workers)?;

        let mut tasks: FuturesUnordered<_> = initialized
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect();

        let mut errors = Vec::new();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => errors.push(error),
                Err(join_error) => {
                    self.stop.trigger(join_error.to_string());
                    errors.push(EngineError::Cancelled(format!(
                        "worker task failed: {join_error}"
                    )));
                }
            }
        }

        let finished_at = Utc::now();
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            workers: self.worker_status(),
            errors,
            stop_reason: self.stop.reason(),
        };
        let outcome = if report.is_success() { "finished" } else { "failed" };
        self.log.log(
            if report.is_success() {
                LogLevel::Basic
            } else {
                LogLevel::Minimal
            },
            "engine",
            &format!(
                "run {run_id} {outcome} in {}ms",
                report.duration().num_milliseconds()
            ),
        );
        Ok(report)
    }

    /// Initializes every worker; on the first failure the rest are retired
    /// unused and the run never starts.
    fn initialize_all(&self, workers: Vec<StageWorker>) -> Result<Vec<StageWorker>, EngineError> {
        let mut initialized = Vec::with_capacity(workers.len());
        let mut pending = workers.into_iter();
        while let Some(mut worker) = pending.next() {
            if let Err(error) = worker.initialize() {
                self.stop.trigger(error.to_string());
                self.log
                    .log(LogLevel::Minimal, "engine", &error.to_string());
                worker.abort();
                for unused in initialized.into_iter().chain(pending) {
                    unused.abort();
                }
                return Err(error);
            }
            initialized.push(worker);
        }
        Ok(initialized)
    }
}
