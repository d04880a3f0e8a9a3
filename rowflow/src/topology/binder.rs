//! Binding: turning a graph definition into concrete queues.
//!
//! Runs once at graph start. Every hop (A -> B) is classified by its copy
//! counts into a fan pattern, one queue is allocated per pattern instance,
//! and each stage copy ends up owning its concrete input and output binding
//! sets. Wiring failures here are fatal and abort the run before any worker
//! is spawned.

use super::{FanPattern, GraphDefinition, PartitionMethod, StageDescriptor};
use crate::errors::WiringError;
use crate::log::{LogLevel, LogSink};
use crate::queue::{Endpoint, QueueBinding, RowQueue};
use std::collections::HashMap;
use std::sync::Arc;

/// Precomputed modulo routing for one partitioned downstream stage.
///
/// `queues[i]` is the single queue bound to `partition_ids[i]`; the worker
/// resolves the key column once and indexes with `key mod len`.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    /// The downstream stage receiving per-partition data.
    pub target_stage: String,
    /// The key field configured on the downstream stage.
    pub key_field: String,
    /// The immutable ordered partition-ID list of the downstream stage.
    pub partition_ids: Vec<String>,
    /// One queue per partition ID, in partition-ID order.
    pub queues: Vec<Arc<RowQueue>>,
}

/// Everything one stage copy owns after binding.
#[derive(Debug, Default)]
pub struct WorkerBindings {
    /// Input queues, in upstream declaration order.
    pub inputs: Vec<QueueBinding>,
    /// Output queues, in downstream declaration order (error target removed).
    pub outputs: Vec<QueueBinding>,
    /// The dedicated error-output binding, if error routing targets a stage.
    pub error_output: Option<QueueBinding>,
    /// Modulo routing plans, one per partitioned downstream stage.
    pub partition_plans: Vec<PartitionPlan>,
    /// True when the downstream stages use mirror partitioning.
    pub mirror: bool,
}

/// The bound queue graph, ready to hand to workers.
#[derive(Debug, Default)]
pub struct BoundTopology {
    workers: HashMap<Endpoint, WorkerBindings>,
    queue_total: usize,
}

impl BoundTopology {
    /// Returns the total number of allocated queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queue_total
    }

    /// Returns the bindings of one stage copy.
    #[must_use]
    pub fn bindings(&self, endpoint: &Endpoint) -> Option<&WorkerBindings> {
        self.workers.get(endpoint)
    }

    /// Removes and returns the bindings of one stage copy.
    pub fn take_bindings(&mut self, endpoint: &Endpoint) -> Option<WorkerBindings> {
        self.workers.remove(endpoint)
    }

    /// Finds the queue between two concrete stage copies, if bound.
    #[must_use]
    pub fn find_queue(
        &self,
        origin: &str,
        origin_copy: usize,
        destination: &str,
        destination_copy: usize,
    ) -> Option<Arc<RowQueue>> {
        let endpoint = Endpoint::new(origin, origin_copy);
        let bindings = self.workers.get(&endpoint)?;
        bindings
            .outputs
            .iter()
            .chain(bindings.error_output.iter())
            .find(|b| b.destination.stage == destination && b.destination.copy == destination_copy)
            .map(|b| Arc::clone(&b.queue))
    }
}

/// Builds the queue graph for a run.
#[derive(Debug, Clone)]
pub struct TopologyBinder {
    queue_capacity: usize,
}

impl TopologyBinder {
    /// Creates a binder allocating queues of the given capacity.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self { queue_capacity }
    }

    /// Binds the full graph, or fails with the first wiring error.
    pub fn bind(
        &self,
        graph: &GraphDefinition,
        log: &dyn LogSink,
    ) -> Result<BoundTopology, WiringError> {
        validate_graph(graph)?;

        let mut topology = BoundTopology::default();
        for stage in &graph.stages {
            for copy in 0..stage.effective_copies() {
                topology
                    .workers
                    .insert(Endpoint::new(&stage.name, copy), WorkerBindings::default());
            }
        }

        for stage in &graph.stages {
            for target_name in &stage.downstream {
                // Resolution was validated above.
                let Some(target) = graph.find(target_name) else {
                    continue;
                };
                self.bind_edge(&mut topology, stage, target, log)?;
            }
        }

        for stage in &graph.stages {
            extract_error_outputs(&mut topology, stage)?;
        }

        log.log(
            LogLevel::Basic,
            "binder",
            &format!(
                "bound {} queues across {} workers",
                topology.queue_total,
                topology.workers.len()
            ),
        );
        Ok(topology)
    }

    /// Allocates the queues of one hop and records them at both endpoints.
    fn bind_edge(
        &self,
        topology: &mut BoundTopology,
        origin: &StageDescriptor,
        destination: &StageDescriptor,
        log: &dyn LogSink,
    ) -> Result<(), WiringError> {
        let a = origin.effective_copies();
        let b = destination.effective_copies();
        let pattern = FanPattern::classify(a, b);

        let pairs: Vec<(usize, usize)> = match pattern {
            FanPattern::OneToOne => vec![(0, 0)],
            FanPattern::OneToMany => (0..b).map(|j| (0, j)).collect(),
            FanPattern::ManyToOne => (0..a).map(|i| (i, 0)).collect(),
            FanPattern::CopyAligned => (0..a).map(|i| (i, i)).collect(),
            FanPattern::CrossProduct => (0..a)
                .flat_map(|i| (0..b).map(move |j| (i, j)))
                .collect(),
        };

        let mut per_origin: HashMap<usize, Vec<Arc<RowQueue>>> = HashMap::new();
        for (i, j) in pairs {
            let queue = Arc::new(RowQueue::new(self.queue_capacity));
            let binding = QueueBinding::new(
                Endpoint::new(&origin.name, i),
                Endpoint::new(&destination.name, j),
                Arc::clone(&queue),
            );
            log.log(
                LogLevel::Detailed,
                "binder",
                &format!("allocated {pattern} queue {binding}"),
            );

            if let Some(bindings) = topology.workers.get_mut(&binding.origin) {
                bindings.outputs.push(binding.clone());
            }
            if let Some(bindings) = topology.workers.get_mut(&binding.destination) {
                bindings.inputs.push(binding);
            }
            per_origin.entry(i).or_default().push(queue);
            topology.queue_total += 1;
        }

        match destination.partitioning.method {
            PartitionMethod::Modulo => {
                let key_field = destination
                    .partitioning
                    .key_field
                    .clone()
                    .unwrap_or_default();
                for copy in 0..a {
                    let queues = per_origin.remove(&copy).unwrap_or_default();
                    if queues.len() != destination.partitioning.partition_ids.len() {
                        return Err(WiringError::new(format!(
                            "stage '{}' copy {} reaches {} of the {} partitions of '{}'",
                            origin.name,
                            copy,
                            queues.len(),
                            destination.partitioning.partition_ids.len(),
                            destination.name
                        ))
                        .with_stages(vec![origin.name.clone(), destination.name.clone()]));
                    }
                    if let Some(bindings) =
                        topology.workers.get_mut(&Endpoint::new(&origin.name, copy))
                    {
                        bindings.partition_plans.push(PartitionPlan {
                            target_stage: destination.name.clone(),
                            key_field: key_field.clone(),
                            partition_ids: destination.partitioning.partition_ids.clone(),
                            queues,
                        });
                    }
                }
            }
            PartitionMethod::Mirror => {
                for copy in 0..a {
                    if let Some(bindings) =
                        topology.workers.get_mut(&Endpoint::new(&origin.name, copy))
                    {
                        bindings.mirror = true;
                    }
                }
            }
            PartitionMethod::None => {}
        }

        Ok(())
    }
}

/// Moves each copy's binding towards the error target out of the normal
/// output set.
fn extract_error_outputs(
    topology: &mut BoundTopology,
    stage: &StageDescriptor,
) -> Result<(), WiringError> {
    if !stage.error_routing.enabled {
        return Ok(());
    }
    let Some(target) = &stage.error_routing.target_stage else {
        return Ok(());
    };

    for copy in 0..stage.effective_copies() {
        let endpoint = Endpoint::new(&stage.name, copy);
        let Some(bindings) = topology.workers.get_mut(&endpoint) else {
            continue;
        };
        let matching: Vec<usize> = bindings
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, b)| b.destination.stage.eq_ignore_ascii_case(target))
            .map(|(i, _)| i)
            .collect();
        match matching.as_slice() {
            [index] => {
                bindings.error_output = Some(bindings.outputs.remove(*index));
            }
            [] => {
                return Err(WiringError::new(format!(
                    "stage '{}' copy {copy} has no queue towards error target '{target}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone(), target.clone()]));
            }
            _ => {
                return Err(WiringError::new(format!(
                    "stage '{}' copy {copy} has {} queues towards error target '{target}'; \
                     the error target must resolve to exactly one queue per copy",
                    stage.name,
                    matching.len()
                ))
                .with_stages(vec![stage.name.clone(), target.clone()]));
            }
        }
    }
    Ok(())
}

/// Structural validation before any queue is allocated.
fn validate_graph(graph: &GraphDefinition) -> Result<(), WiringError> {
    for (i, stage) in graph.stages.iter().enumerate() {
        if graph.stages[..i].iter().any(|s| s.name == stage.name) {
            return Err(WiringError::new(format!(
                "duplicate stage name '{}'",
                stage.name
            ))
            .with_stages(vec![stage.name.clone()]));
        }
        if stage.copies == 0 {
            return Err(
                WiringError::new(format!("stage '{}' declares zero copies", stage.name))
                    .with_stages(vec![stage.name.clone()]),
            );
        }

        for name in stage.downstream.iter().chain(stage.upstream.iter()) {
            if graph.find(name).is_none() {
                return Err(WiringError::new(format!(
                    "stage '{}' references unresolved stage '{name}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone(), name.clone()]));
            }
        }
        for name in &stage.downstream {
            let peer = graph.find(name);
            if peer.is_some_and(|p| !p.upstream.contains(&stage.name)) {
                return Err(WiringError::new(format!(
                    "stage '{}' lists '{name}' downstream but '{name}' does not list it upstream",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone(), name.clone()]));
            }
        }

        // Modulo routing sends every row through a partition plan, so a
        // producer cannot also feed unpartitioned consumers. The error
        // target is exempt: rejected rows bypass partitioning.
        let error_target = stage
            .error_routing
            .enabled
            .then(|| stage.error_routing.target_stage.as_deref())
            .flatten();
        let consumers: Vec<&StageDescriptor> = stage
            .downstream
            .iter()
            .filter(|name| Some(name.as_str()) != error_target)
            .filter_map(|name| graph.find(name))
            .collect();
        let partitioned = consumers
            .iter()
            .filter(|c| c.partitioning.method == PartitionMethod::Modulo)
            .count();
        if partitioned > 0 && partitioned < consumers.len() {
            return Err(WiringError::new(format!(
                "stage '{}' feeds both modulo-partitioned and unpartitioned stages; \
                 partitioned and unpartitioned consumers cannot share a producer",
                stage.name
            ))
            .with_stages(vec![stage.name.clone()]));
        }

        if stage.partitioning.method == PartitionMethod::Modulo {
            if stage.partitioning.partition_ids.is_empty() {
                return Err(WiringError::new(format!(
                    "stage '{}' uses modulo partitioning without partition IDs",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()]));
            }
            if stage.partitioning.key_field.is_none() {
                return Err(WiringError::new(format!(
                    "stage '{}' uses modulo partitioning without a key field",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()]));
            }
            let ids = stage.partitioning.partition_ids.len();
            if stage.copies != 1 && stage.copies != ids {
                return Err(WiringError::new(format!(
                    "stage '{}' declares {} copies but {} partition IDs",
                    stage.name, stage.copies, ids
                ))
                .with_stages(vec![stage.name.clone()]));
            }
        }

        if stage.error_routing.enabled {
            if let Some(target) = &stage.error_routing.target_stage {
                if graph.find(target).is_none() {
                    return Err(WiringError::new(format!(
                        "stage '{}' routes errors to unresolved stage '{target}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), target.clone()]));
                }
                if !stage.downstream.contains(target) {
                    return Err(WiringError::new(format!(
                        "stage '{}' routes errors to '{target}' which is not a downstream stage",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), target.clone()]));
                }
            }
        }
    }
    Ok(())
}
