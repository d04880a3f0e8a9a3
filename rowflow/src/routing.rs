//! Partition routing: picking the output queue(s) for a row.
//!
//! Modulo routing sends each row to exactly one queue, chosen by the key
//! value modulo the downstream partition count. Mirror routing broadcasts a
//! copy to every output. Plain distribution stays with the worker.

use crate::errors::EngineError;
use crate::queue::RowQueue;
use crate::row::Row;
use crate::topology::PartitionPlan;
use std::sync::Arc;

/// Modulo routing state for one partitioned downstream stage.
///
/// The key column index is worker-local and resolved once, on the first row
/// this worker routes; the partition-ID -> queue map was precomputed at bind
/// time.
#[derive(Debug)]
pub struct ModuloRouter {
    stage: String,
    plan: PartitionPlan,
    key_index: Option<usize>,
}

impl ModuloRouter {
    /// Creates a router for one plan, owned by `stage`'s worker.
    #[must_use]
    pub fn new(stage: impl Into<String>, plan: PartitionPlan) -> Self {
        Self {
            stage: stage.into(),
            plan,
            key_index: None,
        }
    }

    /// Returns the partition index and queue for a row.
    ///
    /// A missing key field or a non-integer key value is fatal for the
    /// worker.
    pub fn select(&mut self, row: &Row) -> Result<(usize, &Arc<RowQueue>), EngineError> {
        let key_index = match self.key_index {
            Some(index) => index,
            None => {
                let index = row.meta().index_of(&self.plan.key_field).ok_or_else(|| {
                    EngineError::PartitionKey {
                        stage: self.stage.clone(),
                        field: self.plan.key_field.clone(),
                        message: format!("field not found in row {}", row.meta()),
                    }
                })?;
                self.key_index = Some(index);
                index
            }
        };

        let value = row.value_at(key_index).and_then(|v| v.as_integer()).ok_or_else(|| {
            EngineError::PartitionKey {
                stage: self.stage.clone(),
                field: self.plan.key_field.clone(),
                message: "key value is not an integer".to_string(),
            }
        })?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let partition = value.rem_euclid(self.plan.partition_ids.len() as i64) as usize;
        Ok((partition, &self.plan.queues[partition]))
    }

    /// The partition IDs this router covers, in order.
    #[must_use]
    pub fn partition_ids(&self) -> &[String] {
        &self.plan.partition_ids
    }
}

/// The routing mode of one worker's output side.
#[derive(Debug)]
pub enum PartitionRouter {
    /// No partitioning; the worker distributes or broadcasts itself.
    None,
    /// Modulo routing, one router per partitioned downstream stage.
    Modulo(Vec<ModuloRouter>),
    /// Broadcast a copy to every bound output queue.
    Mirror,
}

impl PartitionRouter {
    /// Builds the router for a worker from its bound partition plans.
    #[must_use]
    pub fn new(stage: &str, plans: Vec<PartitionPlan>, mirror: bool) -> Self {
        if !plans.is_empty() {
            Self::Modulo(
                plans
                    .into_iter()
                    .map(|plan| ModuloRouter::new(stage, plan))
                    .collect(),
            )
        } else if mirror {
            Self::Mirror
        } else {
            Self::None
        }
    }

    /// Returns true when the worker delegates routing here.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}
