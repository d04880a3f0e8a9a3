//! End-to-end runs over small graphs.

use super::*;
use crate::log::{CollectingLogSink, NoOpLogSink};
use crate::policy::RowError;
use crate::row::{Row, RowBuilder};
use crate::stage::{FnTransform, PassThrough, RowBuffer, StageError};
use crate::topology::{ErrorRoutingConfig, PartitioningConfig, StageDescriptor};
use crate::worker::WorkerState;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};

/// Rows collected per stage copy, in factory (= copy) order.
type Slots = Arc<Mutex<Vec<Vec<i64>>>>;

fn emitter(ids: Vec<i64>) -> impl Fn() -> Box<dyn Transform> + Send + Sync + 'static {
    move || {
        let mut pending = ids.clone().into_iter();
        Box::new(FnTransform::new("emit", move |_, out: &mut RowBuffer| {
            match pending.next() {
                Some(id) => {
                    out.push(RowBuilder::new().field("id", id).build());
                    Ok(true)
                }
                None => Ok(false),
            }
        }))
    }
}

fn collector(store: &Slots) -> impl Fn() -> Box<dyn Transform> + Send + Sync + 'static {
    let store = Arc::clone(store);
    move || {
        let slot = {
            let mut slots = store.lock();
            slots.push(Vec::new());
            slots.len() - 1
        };
        let store = Arc::clone(&store);
        Box::new(FnTransform::new(
            "collect",
            move |row: Option<Row>, _out: &mut RowBuffer| match row {
                Some(row) => {
                    let id = row.get("id").unwrap().as_integer().unwrap();
                    store.lock()[slot].push(id);
                    Ok(true)
                }
                None => Ok(false),
            },
        ))
    }
}

fn quiet(engine: Engine) -> Engine {
    engine.with_log(Arc::new(NoOpLogSink))
}

#[tokio::test]
async fn test_distribute_splits_rows_round_robin() {
    let store: Slots = Arc::new(Mutex::new(Vec::new()));
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(
            StageDescriptor::new("work")
                .with_copies(3)
                .from_stage("gen"),
        );
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter((0..9).collect()))
            .with_transform("work", collector(&store)),
    );

    let report = engine.run().await.unwrap();
    assert!(report.is_success());
    assert_eq!(
        *store.lock(),
        vec![vec![0, 3, 6], vec![1, 4, 7], vec![2, 5, 8]]
    );
    for copy in 0..3 {
        let status = report.worker("work", copy).unwrap();
        assert_eq!(status.counters.read, 3);
        assert_eq!(status.state, WorkerState::Disposed);
    }
    assert_eq!(report.worker("gen", 0).unwrap().counters.written, 9);
    assert!(report.stop_reason.is_none());
}

#[tokio::test]
async fn test_mirror_broadcasts_to_every_copy() {
    let store: Slots = Arc::new(Mutex::new(Vec::new()));
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(
            StageDescriptor::new("work")
                .with_copies(2)
                .from_stage("gen")
                .with_partitioning(PartitioningConfig::mirror()),
        );
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter(vec![0, 1, 2]))
            .with_transform("work", collector(&store)),
    );

    let report = engine.run().await.unwrap();
    assert!(report.is_success());
    assert_eq!(*store.lock(), vec![vec![0, 1, 2], vec![0, 1, 2]]);
}

#[tokio::test]
async fn test_modulo_partitions_rows_by_key() {
    let store: Slots = Arc::new(Mutex::new(Vec::new()));
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("agg"))
        .with_stage(
            StageDescriptor::new("agg")
                .from_stage("gen")
                .with_partitioning(PartitioningConfig::modulo(
                    "id",
                    vec!["p0".to_string(), "p1".to_string()],
                )),
        );
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter((0..6).collect()))
            .with_transform("agg", collector(&store)),
    );

    let report = engine.run().await.unwrap();
    assert!(report.is_success());
    // Same key, same copy: evens on partition p0, odds on p1.
    assert_eq!(*store.lock(), vec![vec![0, 2, 4], vec![1, 3, 5]]);
    assert_eq!(report.worker("agg", 0).unwrap().counters.read, 3);
    assert_eq!(report.worker("agg", 1).unwrap().counters.read, 3);
}

#[tokio::test]
async fn test_safe_mode_stops_run_on_shape_change() {
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(StageDescriptor::new("work").from_stage("gen"));
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", || {
                let mut emitted = 0;
                Box::new(FnTransform::new("emit", move |_, out: &mut RowBuffer| {
                    emitted += 1;
                    match emitted {
                        1 => {
                            out.push(RowBuilder::new().field("id", 1i64).build());
                            Ok(true)
                        }
                        2 => {
                            out.push(RowBuilder::new().field("name", "x").build());
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                }))
            })
            .with_transform("work", || Box::new(PassThrough))
            .with_safe_mode(true),
    );

    let report = engine.run().await.unwrap();
    assert!(!report.is_success());
    assert!(report
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::SafeMode { .. })));
    assert!(report.stop_reason.as_deref().unwrap().contains("safe mode"));
}

fn odd_rejecting_filter() -> impl Fn() -> Box<dyn Transform> + Send + Sync + 'static {
    || {
        Box::new(FnTransform::new(
            "filter",
            |row: Option<Row>, out: &mut RowBuffer| {
                let row = row.unwrap();
                let id = row.get("id").unwrap().as_integer().unwrap();
                if id % 2 == 1 {
                    return Err(StageError::Row(
                        RowError::new("odd id").with_fields("id").with_codes("RF001"),
                    ));
                }
                out.push(row);
                Ok(true)
            },
        ))
    }
}

fn error_routed_graph(error_routing: ErrorRoutingConfig) -> GraphDefinition {
    GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("filter"))
        .with_stage(
            StageDescriptor::new("filter")
                .from_stage("gen")
                .to_stage("write")
                .to_stage("bad_rows")
                .with_error_routing(error_routing),
        )
        .with_stage(StageDescriptor::new("write").from_stage("filter"))
        .with_stage(StageDescriptor::new("bad_rows").from_stage("filter"))
}

#[tokio::test]
async fn test_error_rows_arrive_augmented_at_error_target() {
    let good: Slots = Arc::new(Mutex::new(Vec::new()));
    let bad: Arc<Mutex<Vec<(i64, i64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let bad_store = Arc::clone(&bad);

    let graph = error_routed_graph(
        ErrorRoutingConfig::to_stage("bad_rows")
            .with_count_field("nr_errors")
            .with_descriptions_field("error_desc"),
    );
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter((0..6).collect()))
            .with_transform("filter", odd_rejecting_filter())
            .with_transform("write", collector(&good))
            .with_transform("bad_rows", move || {
                let bad = Arc::clone(&bad_store);
                Box::new(FnTransform::new(
                    "collect_errors",
                    move |row: Option<Row>, _out: &mut RowBuffer| {
                        if let Some(row) = row {
                            bad.lock().push((
                                row.get("id").unwrap().as_integer().unwrap(),
                                row.get("nr_errors").unwrap().as_integer().unwrap(),
                                row.get("error_desc").unwrap().as_str().unwrap().to_string(),
                            ));
                        }
                        Ok(true)
                    },
                ))
            }),
    );

    let report = engine.run().await.unwrap();
    assert!(report.is_success());
    assert_eq!(*good.lock(), vec![vec![0, 2, 4]]);
    assert_eq!(
        *bad.lock(),
        vec![
            (1, 1, "odd id".to_string()),
            (3, 1, "odd id".to_string()),
            (5, 1, "odd id".to_string()),
        ]
    );
    assert_eq!(report.worker("filter", 0).unwrap().counters.rejected, 3);
}

#[tokio::test]
async fn test_rejection_threshold_stops_the_run() {
    let good: Slots = Arc::new(Mutex::new(Vec::new()));
    let bad: Slots = Arc::new(Mutex::new(Vec::new()));

    let graph = error_routed_graph(
        ErrorRoutingConfig::to_stage("bad_rows")
            .with_count_field("nr_errors")
            .with_max_errors(1),
    );
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter((0..6).collect()))
            .with_transform("filter", odd_rejecting_filter())
            .with_transform("write", collector(&good))
            .with_transform("bad_rows", collector(&bad)),
    );

    let report = engine.run().await.unwrap();
    assert!(!report.is_success());
    assert!(report
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::ThresholdBreached { .. })));
    assert!(report
        .stop_reason
        .as_deref()
        .unwrap()
        .contains("rejection threshold"));
    // The breaching second bad row was diverted before the check tripped.
    assert_eq!(report.worker("filter", 0).unwrap().counters.rejected, 2);
}

#[tokio::test]
async fn test_rerun_after_stop_processes_rows() {
    let store: Slots = Arc::new(Mutex::new(Vec::new()));
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(StageDescriptor::new("work").from_stage("gen"));
    let engine = quiet(Engine::new(graph));
    let stop = engine.stop_flag();

    // The first instantiation stops the run after two rows; later ones
    // emit the full batch.
    let fired = Arc::new(AtomicBool::new(false));
    let engine = engine
        .with_transform("gen", move || {
            let stop = Arc::clone(&stop);
            let fired = Arc::clone(&fired);
            let mut next = 0i64;
            Box::new(FnTransform::new("emit", move |_, out: &mut RowBuffer| {
                if !fired.load(Ordering::SeqCst) && next == 2 {
                    fired.store(true, Ordering::SeqCst);
                    stop.trigger("operator stop");
                    return Ok(false);
                }
                if next >= 5 {
                    return Ok(false);
                }
                out.push(RowBuilder::new().field("id", next).build());
                next += 1;
                Ok(true)
            }))
        })
        .with_transform("work", collector(&store));

    let first = engine.run().await.unwrap();
    assert_eq!(first.stop_reason.as_deref(), Some("operator stop"));
    assert_eq!(first.worker("gen", 0).unwrap().counters.written, 2);

    // The stale stop must not bleed into the next run.
    let second = engine.run().await.unwrap();
    assert!(second.is_success());
    assert!(second.stop_reason.is_none());
    assert_eq!(second.worker("gen", 0).unwrap().counters.written, 5);
    assert_eq!(second.worker("work", 0).unwrap().counters.read, 5);
}

#[tokio::test]
async fn test_missing_transform_fails_before_start() {
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(StageDescriptor::new("work").from_stage("gen"));
    let engine = quiet(Engine::new(graph).with_transform("gen", emitter(vec![1])));

    let error = engine.run().await.unwrap_err();
    assert!(matches!(error, EngineError::Wiring(_)));
    assert!(error.to_string().contains("no transform registered"));
}

#[tokio::test]
async fn test_init_failure_retires_every_worker() {
    #[derive(Debug)]
    struct RefusesInit;

    #[async_trait::async_trait]
    impl Transform for RefusesInit {
        fn init(&mut self) -> bool {
            false
        }
        async fn process_row(
            &mut self,
            _row: Option<Row>,
            _out: &mut RowBuffer,
        ) -> Result<bool, StageError> {
            Ok(false)
        }
    }

    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(StageDescriptor::new("work").from_stage("gen"));
    let engine = quiet(
        Engine::new(graph)
            .with_transform("gen", emitter(vec![1, 2]))
            .with_transform("work", || Box::new(RefusesInit)),
    );

    let error = engine.run().await.unwrap_err();
    assert!(matches!(error, EngineError::InitFailed { .. }));
    for status in engine.worker_status() {
        assert_eq!(status.state, WorkerState::Disposed, "{}", status.endpoint);
        assert_eq!(status.counters.read, 0);
    }
}

#[tokio::test]
async fn test_run_summary_is_logged() {
    let sink = Arc::new(CollectingLogSink::new());
    let graph = GraphDefinition::new()
        .with_stage(StageDescriptor::new("gen").to_stage("work"))
        .with_stage(StageDescriptor::new("work").from_stage("gen"));
    let engine = Engine::new(graph)
        .with_transform("gen", emitter(vec![1, 2, 3]))
        .with_transform("work", || Box::new(PassThrough))
        .with_log(Arc::clone(&sink) as Arc<dyn LogSink>);

    let report = engine.run().await.unwrap();
    assert!(report.is_success());
    assert!(report.finished_at >= report.started_at);

    let basic = sink.messages_at(LogLevel::Basic);
    assert!(basic.iter().any(|m| m.contains("starting")));
    assert!(basic.iter().any(|m| m.contains("finished")));
}
