//! The stage contract: pluggable per-stage transformation logic.
//!
//! Every stage kind implements [`Transform`] behind a uniform interface; the
//! engine calls `init` once before running, `process_row` for every row (or
//! repeatedly with `None` for stages with no inputs), and `dispose` once
//! after the worker leaves its loop. Callbacks receive all context as
//! explicit parameters and emit output rows through a push-style buffer.

use crate::policy::RowError;
use crate::row::Row;
use crate::worker::WorkerMonitor;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// An error reported by a stage callback.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Bad data in one row; handed to the error-routing policy.
    #[error("row error: {}", .0.descriptions)]
    Row(RowError),

    /// A fatal condition; stops the worker immediately.
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    /// Creates a row-level error with a description.
    #[must_use]
    pub fn row(description: impl Into<String>) -> Self {
        Self::Row(RowError::new(description))
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Collects the rows a callback emits for one invocation.
///
/// A callback may emit zero, one or many rows per input row. The buffer
/// also carries the owning worker's counters, so callbacks that touch
/// external systems can report reads, writes, updates and skips.
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: Vec<Row>,
    monitor: Option<Arc<WorkerMonitor>>,
}

impl RowBuffer {
    /// Creates an empty buffer. Counting calls on a standalone buffer are
    /// no-ops.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer wired to a worker's counters.
    pub(crate) fn for_worker(monitor: Arc<WorkerMonitor>) -> Self {
        Self {
            rows: Vec::new(),
            monitor: Some(monitor),
        }
    }

    /// Counts one row read from an external source.
    pub fn count_input(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.counters().inc_input();
        }
    }

    /// Counts one row written to an external sink.
    pub fn count_output(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.counters().inc_output();
        }
    }

    /// Counts one row updated in an external sink.
    pub fn count_updated(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.counters().inc_updated();
        }
    }

    /// Counts one row deliberately dropped by the callback.
    pub fn count_skipped(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.counters().inc_skipped();
        }
    }

    /// Emits one output row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Drains the emitted rows.
    pub fn drain(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    /// Returns the number of buffered rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Trait for stage transformation callbacks.
#[async_trait]
pub trait Transform: Send + Debug {
    /// One-time setup. Returning false is a fatal error and the worker
    /// never reaches its running state.
    fn init(&mut self) -> bool {
        true
    }

    /// Processes one input row, emitting output rows into `out`.
    ///
    /// `row` is `None` when the stage has no inputs and is being driven as
    /// a source. Returns the continue signal: `Ok(false)` ends the worker's
    /// loop after the emitted rows are delivered.
    async fn process_row(&mut self, row: Option<Row>, out: &mut RowBuffer)
        -> Result<bool, StageError>;

    /// Releases callback-held resources. Called exactly once.
    fn dispose(&mut self) {}
}

/// A closure-backed transform, mostly for tests and simple stages.
pub struct FnTransform<F>
where
    F: FnMut(Option<Row>, &mut RowBuffer) -> Result<bool, StageError> + Send,
{
    name: String,
    func: F,
}

impl<F> FnTransform<F>
where
    F: FnMut(Option<Row>, &mut RowBuffer) -> Result<bool, StageError> + Send,
{
    /// Creates a new closure-backed transform.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnTransform<F>
where
    F: FnMut(Option<Row>, &mut RowBuffer) -> Result<bool, StageError> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: FnMut(Option<Row>, &mut RowBuffer) -> Result<bool, StageError> + Send,
{
    async fn process_row(
        &mut self,
        row: Option<Row>,
        out: &mut RowBuffer,
    ) -> Result<bool, StageError> {
        (self.func)(row, out)
    }
}

/// A transform that forwards every input row unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Transform for PassThrough {
    async fn process_row(
        &mut self,
        row: Option<Row>,
        out: &mut RowBuffer,
    ) -> Result<bool, StageError> {
        match row {
            Some(row) => {
                out.push(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowBuilder;

    #[tokio::test]
    async fn test_pass_through_forwards() {
        let mut stage = PassThrough;
        let mut out = RowBuffer::new();
        let row = RowBuilder::new().field("id", 1i64).build();

        let keep_going = stage.process_row(Some(row.clone()), &mut out).await.unwrap();
        assert!(keep_going);
        assert_eq!(out.drain(), vec![row]);
    }

    #[tokio::test]
    async fn test_pass_through_ends_as_source() {
        let mut stage = PassThrough;
        let mut out = RowBuffer::new();
        let keep_going = stage.process_row(None, &mut out).await.unwrap();
        assert!(!keep_going);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_fn_transform() {
        let mut stage = FnTransform::new("double", |row, out: &mut RowBuffer| {
            if let Some(row) = row {
                out.push(row.clone());
                out.push(row);
            }
            Ok(true)
        });

        let mut out = RowBuffer::new();
        let row = RowBuilder::new().field("id", 1i64).build();
        stage.process_row(Some(row), &mut out).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_stage_error_constructors() {
        assert!(matches!(StageError::row("bad"), StageError::Row(_)));
        assert!(matches!(StageError::fatal("boom"), StageError::Fatal(_)));
    }
}
