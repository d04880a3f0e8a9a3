//! Graph topology: stage descriptors and the queue binder.
//!
//! A graph definition is the parsed form an external loader hands the
//! engine: stage names, copy counts, edges, partitioning and error-routing
//! configuration. The binder turns it into concrete queues at run start.

mod binder;

pub use binder::{BoundTopology, PartitionPlan, TopologyBinder, WorkerBindings};

use serde::{Deserialize, Serialize};
use std::fmt;

/// How rows are routed into a partitioned stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMethod {
    /// No partitioning; distribution is handled by the worker.
    #[default]
    None,
    /// Deterministic routing by `key mod partition_count`.
    Modulo,
    /// Broadcast a copy to every bound output queue.
    Mirror,
}

/// Partitioning configuration for one stage.
///
/// When the method is modulo, the ordered partition-ID list defines the
/// stage's effective copy count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitioningConfig {
    /// The partitioning method.
    pub method: PartitionMethod,
    /// The key field, required for modulo.
    pub key_field: Option<String>,
    /// Ordered partition IDs; length = effective copy count under modulo.
    pub partition_ids: Vec<String>,
}

impl PartitioningConfig {
    /// No partitioning.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Modulo partitioning on `key_field` over `partition_ids`.
    #[must_use]
    pub fn modulo(key_field: impl Into<String>, partition_ids: Vec<String>) -> Self {
        Self {
            method: PartitionMethod::Modulo,
            key_field: Some(key_field.into()),
            partition_ids,
        }
    }

    /// Mirror (broadcast) partitioning.
    #[must_use]
    pub fn mirror() -> Self {
        Self {
            method: PartitionMethod::Mirror,
            key_field: None,
            partition_ids: Vec::new(),
        }
    }
}

/// Per-stage error-row handling configuration.
///
/// Only diagnostic fields with a configured name are appended to diverted
/// rows, in the fixed order count, descriptions, fields, codes. Thresholds
/// of zero are disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorRoutingConfig {
    /// Whether failed rows are diverted instead of failing the worker.
    pub enabled: bool,
    /// The stage receiving diverted rows, if any.
    pub target_stage: Option<String>,
    /// Field name for the error count.
    pub count_field: Option<String>,
    /// Field name for the error descriptions.
    pub descriptions_field: Option<String>,
    /// Field name for the offending field names.
    pub fields_field: Option<String>,
    /// Field name for the error codes.
    pub codes_field: Option<String>,
    /// Abort once more than this many rows were rejected (0 = disabled).
    pub max_errors: u64,
    /// Abort once the rejected percentage exceeds this (0 = disabled).
    pub max_error_percentage: u32,
    /// Evaluate the percentage only after this many rows were read.
    pub min_rows_for_percentage: u64,
}

impl ErrorRoutingConfig {
    /// Enables error routing towards `target_stage`.
    #[must_use]
    pub fn to_stage(target_stage: impl Into<String>) -> Self {
        Self {
            enabled: true,
            target_stage: Some(target_stage.into()),
            ..Self::default()
        }
    }

    /// Sets the count field name.
    #[must_use]
    pub fn with_count_field(mut self, name: impl Into<String>) -> Self {
        self.count_field = Some(name.into());
        self
    }

    /// Sets the descriptions field name.
    #[must_use]
    pub fn with_descriptions_field(mut self, name: impl Into<String>) -> Self {
        self.descriptions_field = Some(name.into());
        self
    }

    /// Sets the offending-fields field name.
    #[must_use]
    pub fn with_fields_field(mut self, name: impl Into<String>) -> Self {
        self.fields_field = Some(name.into());
        self
    }

    /// Sets the codes field name.
    #[must_use]
    pub fn with_codes_field(mut self, name: impl Into<String>) -> Self {
        self.codes_field = Some(name.into());
        self
    }

    /// Sets the absolute rejection threshold.
    #[must_use]
    pub fn with_max_errors(mut self, max_errors: u64) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Sets the percentage rejection threshold.
    #[must_use]
    pub fn with_max_percentage(mut self, percentage: u32, min_rows: u64) -> Self {
        self.max_error_percentage = percentage;
        self.min_rows_for_percentage = min_rows;
        self
    }
}

/// Static configuration for one stage of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage name, unique in the graph.
    pub name: String,
    /// Declared parallel copy count (>= 1). Overridden by the partition-ID
    /// list length when modulo partitioning is active.
    pub copies: usize,
    /// Round-robin across output copies when true; broadcast copies when
    /// false.
    pub distribute: bool,
    /// Partitioning configuration.
    pub partitioning: PartitioningConfig,
    /// Error-row handling configuration.
    pub error_routing: ErrorRoutingConfig,
    /// Ordered upstream stage names.
    pub upstream: Vec<String>,
    /// Ordered downstream stage names.
    pub downstream: Vec<String>,
}

impl StageDescriptor {
    /// Creates a single-copy, distributing stage with no edges.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            copies: 1,
            distribute: true,
            partitioning: PartitioningConfig::none(),
            error_routing: ErrorRoutingConfig::default(),
            upstream: Vec::new(),
            downstream: Vec::new(),
        }
    }

    /// Sets the copy count.
    #[must_use]
    pub fn with_copies(mut self, copies: usize) -> Self {
        self.copies = copies;
        self
    }

    /// Switches the stage to broadcast (copy) mode.
    #[must_use]
    pub fn broadcasting(mut self) -> Self {
        self.distribute = false;
        self
    }

    /// Sets the partitioning configuration.
    #[must_use]
    pub fn with_partitioning(mut self, partitioning: PartitioningConfig) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Sets the error-routing configuration.
    #[must_use]
    pub fn with_error_routing(mut self, error_routing: ErrorRoutingConfig) -> Self {
        self.error_routing = error_routing;
        self
    }

    /// Appends an upstream stage name.
    #[must_use]
    pub fn from_stage(mut self, name: impl Into<String>) -> Self {
        self.upstream.push(name.into());
        self
    }

    /// Appends a downstream stage name.
    #[must_use]
    pub fn to_stage(mut self, name: impl Into<String>) -> Self {
        self.downstream.push(name.into());
        self
    }

    /// The number of workers this stage runs: the partition-ID list length
    /// under modulo partitioning, the declared copy count otherwise.
    #[must_use]
    pub fn effective_copies(&self) -> usize {
        if self.partitioning.method == PartitionMethod::Modulo
            && !self.partitioning.partition_ids.is_empty()
        {
            self.partitioning.partition_ids.len()
        } else {
            self.copies
        }
    }
}

/// The parsed stage graph consumed by the binder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// The stages, in declaration order.
    pub stages: Vec<StageDescriptor>,
}

impl GraphDefinition {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The total number of workers the graph runs.
    #[must_use]
    pub fn total_copies(&self) -> usize {
        self.stages.iter().map(StageDescriptor::effective_copies).sum()
    }
}

/// The shape of the producer-to-consumer copy-count relationship on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanPattern {
    /// One producer copy, one consumer copy: one queue.
    OneToOne,
    /// One producer copy, many consumer copies: one queue per consumer copy.
    OneToMany,
    /// Many producer copies, one consumer copy: one queue per producer copy.
    ManyToOne,
    /// Equal counts: copy *i* feeds copy *i* only.
    CopyAligned,
    /// Unequal counts above one: one queue per copy pair.
    CrossProduct,
}

impl FanPattern {
    /// Classifies an edge by its producer and consumer copy counts.
    ///
    /// Pure in (a, b) and symmetric: both endpoints of a hop derive the same
    /// pattern.
    #[must_use]
    pub fn classify(producer_copies: usize, consumer_copies: usize) -> Self {
        match (producer_copies, consumer_copies) {
            (1, 1) => Self::OneToOne,
            (1, _) => Self::OneToMany,
            (_, 1) => Self::ManyToOne,
            (a, b) if a == b => Self::CopyAligned,
            _ => Self::CrossProduct,
        }
    }

    /// The number of queues the pattern produces for (a, b) copy counts.
    #[must_use]
    pub fn queue_count(producer_copies: usize, consumer_copies: usize) -> usize {
        match Self::classify(producer_copies, consumer_copies) {
            Self::OneToOne => 1,
            Self::OneToMany => consumer_copies,
            Self::ManyToOne | Self::CopyAligned => producer_copies,
            Self::CrossProduct => producer_copies * consumer_copies,
        }
    }
}

impl fmt::Display for FanPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneToOne => write!(f, "1:1"),
            Self::OneToMany => write!(f, "1:N"),
            Self::ManyToOne => write!(f, "N:1"),
            Self::CopyAligned => write!(f, "N:N"),
            Self::CrossProduct => write!(f, "N:M"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_patterns() {
        assert_eq!(FanPattern::classify(1, 1), FanPattern::OneToOne);
        assert_eq!(FanPattern::classify(1, 4), FanPattern::OneToMany);
        assert_eq!(FanPattern::classify(4, 1), FanPattern::ManyToOne);
        assert_eq!(FanPattern::classify(3, 3), FanPattern::CopyAligned);
        assert_eq!(FanPattern::classify(2, 3), FanPattern::CrossProduct);
    }

    #[test]
    fn test_queue_count_property() {
        for a in 1..=5 {
            for b in 1..=5 {
                let expected = if a == 1 || b == 1 || a == b {
                    a.max(b)
                } else {
                    a * b
                };
                assert_eq!(FanPattern::queue_count(a, b), expected, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn test_effective_copies_follows_partition_ids() {
        let stage = StageDescriptor::new("agg")
            .with_copies(2)
            .with_partitioning(PartitioningConfig::modulo(
                "id",
                vec!["p0".to_string(), "p1".to_string(), "p2".to_string()],
            ));
        assert_eq!(stage.effective_copies(), 3);
    }

    #[test]
    fn test_graph_lookup() {
        let graph = GraphDefinition::new()
            .with_stage(StageDescriptor::new("read").to_stage("write"))
            .with_stage(StageDescriptor::new("write").with_copies(2).from_stage("read"));

        assert!(graph.find("read").is_some());
        assert!(graph.find("missing").is_none());
        assert_eq!(graph.total_copies(), 3);
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let stage = StageDescriptor::new("filter")
            .with_copies(2)
            .with_error_routing(ErrorRoutingConfig::to_stage("bad_rows").with_max_errors(5));
        let json = serde_json::to_string(&stage).unwrap();
        let back: StageDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "filter");
        assert_eq!(back.error_routing.max_errors, 5);
    }
}
