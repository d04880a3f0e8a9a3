//! The per-copy worker: fetch, transform, deliver.
//!
//! One [`StageWorker`] drives one stage copy through its lifecycle
//! (created, initialized, running, stopped or finished, disposed). The
//! worker owns its transform and its queue bindings; the only things it
//! shares are the queues themselves, the run's stop flag and its monitor.

mod backoff;

pub use backoff::Backoff;

use crate::errors::EngineError;
use crate::log::{LogLevel, LogSink};
use crate::policy::{ErrorRoutingPolicy, RowError};
use crate::queue::{Endpoint, QueueBinding, RowQueue};
use crate::routing::PartitionRouter;
use crate::row::{Row, RowMeta};
use crate::stage::{RowBuffer, StageError, Transform};
use crate::topology::{StageDescriptor, WorkerBindings};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often (in delivered rows) the worker samples its output pressure.
const PRESSURE_CHECK_INTERVAL: u64 = 256;

/// Cooperative stop signal shared by every worker of a run.
///
/// The first trigger wins; later reasons are dropped.
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl StopFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag with a reason. Idempotent; keeps the first reason.
    pub fn trigger(&self, reason: impl Into<String>) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            *self.reason.write() = Some(reason.into());
        }
    }

    /// Returns true once any worker or the host has asked for a stop.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns the first stop reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Clears the flag and reason so the next run starts unstopped.
    pub fn reset(&self) {
        *self.reason.write() = None;
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// The lifecycle states of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Constructed, transform not yet initialized.
    Created = 0,
    /// Transform init succeeded.
    Initialized = 1,
    /// Processing rows.
    Running = 2,
    /// Left the loop early, by stop flag or fatal error.
    Stopped = 3,
    /// Drained all inputs and delivered all outputs.
    Finished = 4,
    /// Transform disposed, worker fully retired.
    Disposed = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopped,
            4 => Self::Finished,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Finished => write!(f, "finished"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Lock-free per-worker throughput counters.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    read: AtomicU64,
    written: AtomicU64,
    input: AtomicU64,
    output: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    blocked_on_empty_ns: AtomicU64,
    blocked_on_full_ns: AtomicU64,
}

impl WorkerCounters {
    /// Rows fetched from input queues.
    #[must_use]
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Rows delivered to output queues.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Rows diverted to the error output.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Counts one row fetched from an input queue.
    pub fn inc_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row delivered downstream.
    pub fn inc_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row read from an external source.
    pub fn inc_input(&self) {
        self.input.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row written to an external sink.
    pub fn inc_output(&self) {
        self.output.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row updated in an external sink.
    pub fn inc_updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row deliberately dropped by the transform.
    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row diverted to the error output.
    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one fatal error.
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds time spent waiting on empty inputs.
    pub fn add_blocked_on_empty(&self, elapsed: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.blocked_on_empty_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Adds time spent waiting on full outputs.
    pub fn add_blocked_on_full(&self, elapsed: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.blocked_on_full_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            blocked_on_empty_ns: self.blocked_on_empty_ns.load(Ordering::Relaxed),
            blocked_on_full_ns: self.blocked_on_full_ns.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Rows fetched from input queues.
    pub read: u64,
    /// Rows delivered to output queues.
    pub written: u64,
    /// Rows read from an external source.
    pub input: u64,
    /// Rows written to an external sink.
    pub output: u64,
    /// Rows updated in an external sink.
    pub updated: u64,
    /// Rows deliberately dropped.
    pub skipped: u64,
    /// Rows diverted to the error output.
    pub rejected: u64,
    /// Fatal errors.
    pub errors: u64,
    /// Nanoseconds spent waiting on empty inputs.
    pub blocked_on_empty_ns: u64,
    /// Nanoseconds spent waiting on full outputs.
    pub blocked_on_full_ns: u64,
}

/// The shared observation point of one worker.
///
/// The worker updates it, the engine and host read it while the run is in
/// flight.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    state: AtomicU8,
    counters: WorkerCounters,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
}

impl WorkerMonitor {
    /// Creates a monitor in the created state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Records a lifecycle transition.
    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The worker's counters.
    #[must_use]
    pub fn counters(&self) -> &WorkerCounters {
        &self.counters
    }

    /// Records when the worker entered its loop.
    pub fn mark_started(&self) {
        *self.started_at.write() = Some(Utc::now());
    }

    /// Records when the worker left its loop.
    pub fn mark_finished(&self) {
        *self.finished_at.write() = Some(Utc::now());
    }

    /// Builds a status snapshot for `endpoint`.
    #[must_use]
    pub fn status(&self, endpoint: &Endpoint) -> WorkerStatus {
        WorkerStatus {
            endpoint: endpoint.clone(),
            state: self.state(),
            counters: self.counters.snapshot(),
            started_at: *self.started_at.read(),
            finished_at: *self.finished_at.read(),
        }
    }
}

/// One worker's externally visible status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// The stage copy.
    pub endpoint: Endpoint,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Counter values at snapshot time.
    pub counters: CountersSnapshot,
    /// When the worker entered its loop, once running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker left its loop, once stopped or finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Drives one stage copy.
pub struct StageWorker {
    endpoint: Endpoint,
    transform: Box<dyn Transform>,
    inputs: Vec<QueueBinding>,
    outputs: Vec<QueueBinding>,
    error_output: Option<QueueBinding>,
    router: PartitionRouter,
    policy: ErrorRoutingPolicy,
    distribute: bool,
    safe_mode: bool,
    reference_meta: Option<Arc<RowMeta>>,
    next_input: usize,
    next_output: usize,
    rows_since_pressure_check: u64,
    read_backoff: Backoff,
    write_backoff: Backoff,
    monitor: Arc<WorkerMonitor>,
    stop: Arc<StopFlag>,
    log: Arc<dyn LogSink>,
}

impl fmt::Debug for StageWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWorker")
            .field("endpoint", &self.endpoint)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("state", &self.monitor.state())
            .finish_non_exhaustive()
    }
}

impl StageWorker {
    /// Creates the worker for one stage copy from its bound queues.
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        transform: Box<dyn Transform>,
        bindings: WorkerBindings,
        descriptor: &StageDescriptor,
        safe_mode: bool,
        monitor: Arc<WorkerMonitor>,
        stop: Arc<StopFlag>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let router = PartitionRouter::new(&endpoint.stage, bindings.partition_plans, bindings.mirror);
        let policy = ErrorRoutingPolicy::new(&endpoint.stage, descriptor.error_routing.clone());
        Self {
            endpoint,
            transform,
            inputs: bindings.inputs,
            outputs: bindings.outputs,
            error_output: bindings.error_output,
            router,
            policy,
            distribute: descriptor.distribute,
            safe_mode,
            reference_meta: None,
            next_input: 0,
            next_output: 0,
            rows_since_pressure_check: 0,
            read_backoff: Backoff::new(),
            write_backoff: Backoff::new(),
            monitor,
            stop,
            log,
        }
    }

    /// The stage copy this worker drives.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Runs the transform's one-time setup.
    ///
    /// A refused init is fatal for the whole run.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.transform.init() {
            self.monitor.set_state(WorkerState::Initialized);
            self.log
                .log(LogLevel::Detailed, &self.endpoint.to_string(), "initialized");
            Ok(())
        } else {
            self.monitor.counters.inc_errors();
            self.monitor.set_state(WorkerState::Stopped);
            Err(EngineError::InitFailed {
                stage: self.endpoint.stage.clone(),
                copy: self.endpoint.copy,
            })
        }
    }

    /// Retires a worker that never ran, after another copy failed to
    /// initialize.
    pub fn abort(mut self) {
        self.close_outputs();
        self.transform.dispose();
        self.monitor.set_state(WorkerState::Disposed);
    }

    /// Runs the worker to completion.
    ///
    /// Always closes the output queues and disposes the transform, whether
    /// the loop ended by drained inputs, stop flag or fatal error.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.monitor.set_state(WorkerState::Running);
        self.monitor.mark_started();
        let source = self.endpoint.to_string();
        self.log.log(LogLevel::Detailed, &source, "running");

        let result = if self.inputs.is_empty() {
            self.run_source().await
        } else {
            self.run_piped().await
        };

        self.close_outputs();
        self.monitor.mark_finished();
        match &result {
            Ok(()) => {
                let state = if self.stop.is_set() {
                    WorkerState::Stopped
                } else {
                    WorkerState::Finished
                };
                self.monitor.set_state(state);
                let counters = self.monitor.counters();
                self.log.log(
                    LogLevel::Basic,
                    &source,
                    &format!(
                        "{state} (read={}, written={}, rejected={})",
                        counters.read(),
                        counters.written(),
                        counters.rejected()
                    ),
                );
            }
            Err(error) => {
                self.monitor.counters.inc_errors();
                self.monitor.set_state(WorkerState::Stopped);
                self.stop.trigger(error.to_string());
                self.log.log(LogLevel::Minimal, &source, &error.to_string());
            }
        }

        self.transform.dispose();
        self.monitor.set_state(WorkerState::Disposed);
        result
    }

    /// Loop for stages with no inputs: the transform is invoked with no row
    /// until it signals the end.
    async fn run_source(&mut self) -> Result<(), EngineError> {
        let mut out = RowBuffer::for_worker(Arc::clone(&self.monitor));
        loop {
            if self.stop.is_set() {
                return Ok(());
            }
            let keep_going = match self.transform.process_row(None, &mut out).await {
                Ok(keep_going) => keep_going,
                Err(error) => return Err(self.fatal(&error)),
            };
            self.deliver(&mut out).await?;
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Loop for stages with inputs: fetch, validate, transform, deliver.
    async fn run_piped(&mut self) -> Result<(), EngineError> {
        let mut out = RowBuffer::for_worker(Arc::clone(&self.monitor));
        let divert_errors = self.policy.is_enabled() && self.error_output.is_some();
        loop {
            if self.stop.is_set() {
                return Ok(());
            }
            let Some(row) = self.fetch_row().await? else {
                return Ok(());
            };
            if self.safe_mode {
                self.check_row_shape(&row)?;
            }

            // The input row outlives the callback only when it may need to
            // be diverted.
            let retained = divert_errors.then(|| row.clone());
            match self.transform.process_row(Some(row), &mut out).await {
                Ok(keep_going) => {
                    self.deliver(&mut out).await?;
                    if !keep_going {
                        return Ok(());
                    }
                }
                Err(StageError::Row(row_error)) => {
                    self.deliver(&mut out).await?;
                    match retained {
                        Some(original) => self.divert_row(&original, &row_error).await?,
                        None => {
                            return Err(EngineError::Stage {
                                stage: self.endpoint.stage.clone(),
                                copy: self.endpoint.copy,
                                message: row_error.descriptions,
                            })
                        }
                    }
                }
                Err(error) => return Err(self.fatal(&error)),
            }
        }
    }

    /// Fetches the next row, round-robin across the live inputs.
    ///
    /// Exhausted inputs (done and drained) leave the rotation for good. A
    /// full pass with nothing to pop backs off before the next one. Returns
    /// `None` when every input is exhausted or a stop was requested.
    async fn fetch_row(&mut self) -> Result<Option<Row>, EngineError> {
        loop {
            if self.stop.is_set() {
                return Ok(None);
            }

            let mut scanned = 0;
            while scanned < self.inputs.len() {
                let index = self.next_input % self.inputs.len();
                let binding = &self.inputs[index];
                if let Some(row) = binding.queue.pop() {
                    self.next_input = (index + 1) % self.inputs.len();
                    self.read_backoff.reset();
                    self.monitor.counters.inc_read();
                    if self.log.is_enabled(LogLevel::RowLevel) {
                        self.log.log(
                            LogLevel::RowLevel,
                            &self.endpoint.to_string(),
                            &format!("read row from {}", binding.origin),
                        );
                    }
                    return Ok(Some(row));
                }
                if binding.queue.is_done() && binding.queue.is_empty() {
                    self.log.log(
                        LogLevel::Detailed,
                        &self.endpoint.to_string(),
                        &format!("input from {} exhausted", binding.origin),
                    );
                    self.inputs.remove(index);
                    if self.next_input >= self.inputs.len() {
                        self.next_input = 0;
                    }
                    scanned = 0;
                    continue;
                }
                self.next_input = (index + 1) % self.inputs.len();
                scanned += 1;
            }

            if self.inputs.is_empty() {
                return Ok(None);
            }
            let started = Instant::now();
            self.read_backoff.wait().await;
            self.monitor.counters.add_blocked_on_empty(started.elapsed());
        }
    }

    /// Validates a row against the first row's shape.
    fn check_row_shape(&mut self, row: &Row) -> Result<(), EngineError> {
        match &self.reference_meta {
            None => {
                if let Some(name) = row.meta().find_duplicate_name() {
                    return Err(EngineError::SafeMode {
                        stage: self.endpoint.stage.clone(),
                        copy: self.endpoint.copy,
                        message: format!("duplicate field name '{name}'"),
                    });
                }
                self.reference_meta = Some(Arc::clone(row.meta()));
                Ok(())
            }
            Some(reference) => {
                row.meta()
                    .check_compatible(reference)
                    .map_err(|error| EngineError::SafeMode {
                        stage: self.endpoint.stage.clone(),
                        copy: self.endpoint.copy,
                        message: error.to_string(),
                    })
            }
        }
    }

    /// Delivers every buffered output row.
    async fn deliver(&mut self, out: &mut RowBuffer) -> Result<(), EngineError> {
        for row in out.drain() {
            self.deliver_row(row).await?;
        }
        Ok(())
    }

    /// Delivers one row according to the stage's routing mode.
    async fn deliver_row(&mut self, row: Row) -> Result<(), EngineError> {
        let targets: Vec<Arc<RowQueue>> = if let PartitionRouter::Modulo(routers) = &mut self.router
        {
            let mut targets = Vec::with_capacity(routers.len());
            for router in routers.iter_mut() {
                let (_, queue) = router.select(&row)?;
                targets.push(Arc::clone(queue));
            }
            targets
        } else if matches!(self.router, PartitionRouter::Mirror) || !self.distribute {
            self.outputs.iter().map(|b| Arc::clone(&b.queue)).collect()
        } else if self.outputs.is_empty() {
            Vec::new()
        } else {
            let index = self.next_output % self.outputs.len();
            self.next_output = (index + 1) % self.outputs.len();
            vec![Arc::clone(&self.outputs[index].queue)]
        };

        let target_count = targets.len();
        if let Some((last, rest)) = targets.split_last() {
            for queue in rest {
                self.push_row(queue, row.clone()).await;
            }
            self.push_row(last, row).await;
        }
        self.monitor.counters.inc_written();
        if self.log.is_enabled(LogLevel::RowLevel) {
            self.log.log(
                LogLevel::RowLevel,
                &self.endpoint.to_string(),
                &format!("wrote row to {target_count} queue(s)"),
            );
        }
        self.maybe_log_pressure();
        Ok(())
    }

    /// Pushes one row, backing off while the queue is full.
    ///
    /// The row is dropped when the consumer marked the queue done or the
    /// run is stopping; there is nobody left to receive it.
    async fn push_row(&mut self, queue: &Arc<RowQueue>, row: Row) {
        let mut row = row;
        loop {
            if self.stop.is_set() || queue.is_done() {
                return;
            }
            match queue.try_push(row) {
                Ok(()) => {
                    self.write_backoff.reset();
                    return;
                }
                Err(bounced) => {
                    row = bounced;
                    let started = Instant::now();
                    self.write_backoff.wait().await;
                    self.monitor.counters.add_blocked_on_full(started.elapsed());
                }
            }
        }
    }

    /// Builds the augmented error row and sends it to the error output.
    async fn divert_row(&mut self, row: &Row, error: &RowError) -> Result<(), EngineError> {
        let error_row = self.policy.error_row(row, error);
        let queue = self
            .error_output
            .as_ref()
            .map(|binding| Arc::clone(&binding.queue));
        if let Some(queue) = queue {
            self.push_row(&queue, error_row).await;
        }
        self.monitor.counters.inc_rejected();
        if self.log.is_enabled(LogLevel::RowLevel) {
            self.log.log(
                LogLevel::RowLevel,
                &self.endpoint.to_string(),
                &format!("diverted row: {}", error.descriptions),
            );
        }

        let rejected = self.monitor.counters.rejected();
        let read = self.monitor.counters.read();
        match self.policy.check_thresholds(rejected, read) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Samples output congestion every [`PRESSURE_CHECK_INTERVAL`] rows and
    /// reports the advisory priority bucket.
    fn maybe_log_pressure(&mut self) {
        self.rows_since_pressure_check += 1;
        if self.rows_since_pressure_check < PRESSURE_CHECK_INTERVAL {
            return;
        }
        self.rows_since_pressure_check = 0;
        if !self.log.is_enabled(LogLevel::Debug) {
            return;
        }
        let bucket = self.pressure_bucket();
        self.log.log(
            LogLevel::Debug,
            &self.endpoint.to_string(),
            &format!("output pressure bucket {bucket} of 5"),
        );
    }

    /// Buckets the fullest output queue into an advisory priority.
    ///
    /// Bucket 1 means heavily congested (slow down), bucket 5 means the
    /// outputs are nearly empty.
    fn pressure_bucket(&self) -> u8 {
        let mut worst = 0.0f64;
        for binding in &self.outputs {
            #[allow(clippy::cast_precision_loss)]
            let ratio = binding.queue.len() as f64 / binding.queue.capacity().max(1) as f64;
            if ratio > worst {
                worst = ratio;
            }
        }
        if worst > 0.95 {
            1
        } else if worst >= 0.75 {
            2
        } else if worst >= 0.50 {
            3
        } else if worst >= 0.25 {
            4
        } else {
            5
        }
    }

    fn fatal(&self, error: &StageError) -> EngineError {
        EngineError::Stage {
            stage: self.endpoint.stage.clone(),
            copy: self.endpoint.copy,
            message: error.to_string(),
        }
    }

    /// Marks every output (error output included) done so consumers can
    /// drain and finish.
    fn close_outputs(&self) {
        for binding in &self.outputs {
            binding.queue.mark_done();
        }
        if let Some(binding) = &self.error_output {
            binding.queue.mark_done();
        }
    }
}
