//! # Rowflow
//!
//! A concurrent row-streaming execution engine for stage graphs.
//!
//! Rowflow runs a directed graph of stages where every stage copy is an
//! independent worker connected to its peers by bounded row queues:
//!
//! - **Topology binding**: hops are classified by copy counts into fan
//!   patterns and turned into single-producer single-consumer queues
//! - **Partition routing**: rows can be spread round-robin, broadcast, or
//!   routed by a key field so equal keys always land on the same copy
//! - **Error-row policy**: bad rows are diverted to a dedicated error stage
//!   with diagnostic fields, guarded by rejection thresholds
//! - **Backpressure**: full and empty queues are handled with an adaptive
//!   backoff instead of unbounded buffering
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowflow::prelude::*;
//!
//! let graph = GraphDefinition::new()
//!     .with_stage(StageDescriptor::new("read").to_stage("transform"))
//!     .with_stage(
//!         StageDescriptor::new("transform")
//!             .with_copies(4)
//!             .from_stage("read"),
//!     );
//!
//! let report = Engine::new(graph)
//!     .with_transform("read", || Box::new(CsvSource::new("input.csv")))
//!     .with_transform("transform", || Box::new(Uppercase::default()))
//!     .run()
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod engine;
pub mod errors;
pub mod log;
pub mod policy;
pub mod queue;
pub mod routing;
pub mod row;
pub mod stage;
pub mod topology;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{Engine, RunReport, TransformFactory};
    pub use crate::errors::{EngineError, WiringError};
    pub use crate::log::{LogLevel, LogSink, NoOpLogSink, TracingLogSink};
    pub use crate::policy::{ErrorRoutingPolicy, RowError};
    pub use crate::queue::{Endpoint, QueueBinding, RowQueue};
    pub use crate::routing::PartitionRouter;
    pub use crate::row::{FieldMeta, Row, RowBuilder, RowMeta, Value, ValueType};
    pub use crate::stage::{FnTransform, PassThrough, RowBuffer, StageError, Transform};
    pub use crate::topology::{
        ErrorRoutingConfig, FanPattern, GraphDefinition, PartitionMethod, PartitioningConfig,
        StageDescriptor, TopologyBinder,
    };
    pub use crate::worker::{
        StageWorker, StopFlag, WorkerCounters, WorkerState, WorkerStatus,
    };
}
