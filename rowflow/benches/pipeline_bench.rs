//! Benchmarks for queue throughput and small end-to-end runs.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rowflow::prelude::*;
use std::sync::Arc;

fn queue_benchmark(c: &mut Criterion) {
    let queue = RowQueue::new(1024);
    let row = RowBuilder::new()
        .field("id", 1i64)
        .field("name", "benchmark")
        .build();

    c.bench_function("queue_push_pop", |b| {
        b.iter(|| {
            queue.try_push(black_box(row.clone())).unwrap();
            black_box(queue.pop());
        });
    });
}

fn run_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("run_1k_rows_through_3_copies", |b| {
        b.iter(|| {
            let graph = GraphDefinition::new()
                .with_stage(StageDescriptor::new("gen").to_stage("work"))
                .with_stage(
                    StageDescriptor::new("work")
                        .with_copies(3)
                        .from_stage("gen"),
                );
            let engine = Engine::new(graph)
                .with_log(Arc::new(NoOpLogSink))
                .with_transform("gen", || {
                    let mut next = 0i64;
                    Box::new(FnTransform::new("gen", move |_, out: &mut RowBuffer| {
                        if next >= 1000 {
                            return Ok(false);
                        }
                        out.push(RowBuilder::new().field("id", next).build());
                        next += 1;
                        Ok(true)
                    }))
                })
                .with_transform("work", || Box::new(PassThrough));

            let report = runtime.block_on(engine.run()).unwrap();
            black_box(report);
        });
    });
}

criterion_group!(benches, queue_benchmark, run_benchmark);
criterion_main!(benches);
