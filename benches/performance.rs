//! Performance benchmarks for the change-feed dispatcher.

use changefeed::{
    ChangeEvent, CursorStore, CheckpointKey, Dispatcher, DispatcherConfig, DispatcherState,
    FieldMatch, FileCursorStore, MemoryCursorStore, MemoryFeed, Namespace, NamespacePattern,
    Operation, OperationKind, RecordKey, ResumeCursor, SequencePosition, SubscriberRegistry,
    SubscriptionFilter, Timestamp,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EVENTS_PER_ITER: u64 = 100;

fn append_order(feed: &MemoryFeed, id: u64) {
    feed.append(
        Operation::Insert {
            document: json!({ "_id": id, "status": "new", "total": id * 10 }),
        },
        Namespace::new("shop", "orders"),
        RecordKey::new(json!({ "_id": id })),
    );
}

/// Benchmark end-to-end fan-out with varying subscriber counts
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");
    group.throughput(Throughput::Elements(EVENTS_PER_ITER));

    for subscribers in [1, 8, 64] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let feed = MemoryFeed::new("orders");
                let registry = Arc::new(SubscriberRegistry::new());
                let handles: Vec<_> = (0..count)
                    .map(|_| registry.subscribe(SubscriptionFilter::all(), 4096))
                    .collect();

                let config = DispatcherConfig {
                    poll_interval: Duration::from_millis(1),
                    checkpoint_interval: 64,
                    ..DispatcherConfig::for_consumer("bench")
                };
                let dispatcher = Dispatcher::new(
                    config,
                    feed.clone(),
                    Arc::clone(&registry),
                    Arc::new(MemoryCursorStore::new()),
                )
                .spawn()
                .unwrap();
                assert!(dispatcher.wait_for(Duration::from_secs(5), |s| {
                    s.state == DispatcherState::Streaming
                }));

                let mut next_id = 0u64;
                b.iter(|| {
                    for _ in 0..EVENTS_PER_ITER {
                        append_order(&feed, next_id);
                        next_id += 1;
                    }
                    for handle in &handles {
                        for _ in 0..EVENTS_PER_ITER {
                            black_box(handle.next_event(Duration::from_secs(5)).unwrap());
                        }
                    }
                });

                dispatcher.stop().unwrap();
            },
        );
    }

    group.finish();
}

/// Benchmark filter evaluation for different filter shapes
fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_evaluate");

    let event = ChangeEvent {
        position: SequencePosition::from_u64(1),
        operation: Operation::Insert {
            document: json!({
                "_id": 1,
                "status": "paid",
                "customer": { "tier": "gold", "region": "eu" },
                "total": 250
            }),
        },
        namespace: Namespace::new("shop", "orders"),
        key: RecordKey::new(json!({ "_id": 1 })),
        timestamp: Timestamp::now(),
    };

    let filters = [
        ("all", SubscriptionFilter::all()),
        (
            "operation",
            SubscriptionFilter::operations(vec![OperationKind::Insert, OperationKind::Update]),
        ),
        (
            "namespace_and_fields",
            SubscriptionFilter::namespace(NamespacePattern::collection("shop", "orders"))
                .with_field(FieldMatch::eq("customer.tier", "gold"))
                .with_field(FieldMatch::gt("total", 100)),
        ),
        (
            "predicate",
            SubscriptionFilter::all().with_predicate(|e| Ok(e.key.0["_id"] == 1)),
        ),
    ];

    for (name, filter) in filters {
        group.bench_function(name, |b| {
            b.iter(|| black_box(filter.evaluate(black_box(&event))));
        });
    }

    group.finish();
}

/// Benchmark durable cursor checkpoints
fn bench_checkpoint(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = FileCursorStore::open(dir.path()).unwrap();
    let key = CheckpointKey::new("orders", "bench");
    let mut n = 0u64;

    c.bench_function("file_checkpoint_save", |b| {
        b.iter(|| {
            n += 1;
            store
                .save(&key, &ResumeCursor::at(SequencePosition::from_u64(n)))
                .unwrap();
        });
    });

    c.bench_function("file_checkpoint_load", |b| {
        b.iter(|| black_box(store.load(&key).unwrap()));
    });
}

criterion_group!(benches, bench_fanout, bench_filters, bench_checkpoint);
criterion_main!(benches);
