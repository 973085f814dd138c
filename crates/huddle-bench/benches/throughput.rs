//! Throughput benchmarks for Huddle.
//!
//! These benchmarks measure hub fan-out, delivery checks and message
//! persistence.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tenvis_huddle_bench::{connect_drained, fixture};
use tenvis_huddle_core::{ConnectionSnapshot, Hub, HubConfig, HubEvent, Route};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark the per-client delivery check.
fn bench_eligibility(c: &mut Criterion) {
    let mut group = c.benchmark_group("eligibility");

    let snapshot = ConnectionSnapshot::new(
        5,
        (0..50).collect(),
        (100..150).collect(),
        Duration::from_secs(3600),
    );
    let team = HubEvent {
        sender_id: 7,
        route: Route::Team(25),
        payload: Arc::from("{}"),
    };
    let conversation = HubEvent {
        sender_id: 7,
        route: Route::Conversation {
            conversation_id: 1,
            audience: (0..1000).collect::<HashSet<_>>(),
        },
        payload: Arc::from("{}"),
    };

    group.bench_function("team", |b| {
        b.iter(|| black_box(&team).is_deliverable_to(black_box(&snapshot)))
    });
    group.bench_function("conversation_1000", |b| {
        b.iter(|| black_box(&conversation).is_deliverable_to(black_box(&snapshot)))
    });

    group.finish();
}

/// Benchmark broadcasting one event to N connected clients.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for clients in [10usize, 100, 1000] {
        let hub = rt.block_on(async {
            let hub = Hub::spawn(HubConfig {
                outbound_queue: 4096,
                ..HubConfig::default()
            });
            connect_drained(&hub, clients, 1).await;
            hub
        });
        let payload: Arc<str> = Arc::from(r#"{"id":1,"sender_id":1,"content":"hello"}"#);

        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.to_async(&rt).iter(|| async {
                hub.broadcast(HubEvent {
                    sender_id: 0,
                    route: Route::Team(1),
                    payload: Arc::clone(&payload),
                })
                .await
                .unwrap();
                // stats is served after the broadcast, so this waits for fan-out
                hub.stats().await.unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark storing a conversation message.
fn bench_send_message(c: &mut Criterion) {
    let rt = runtime();
    let fixture = rt.block_on(fixture());

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send_message", |b| {
        b.to_async(&rt).iter(|| async {
            fixture
                .messages
                .send_message(fixture.conversation_id, 1, "benchmark message")
                .await
                .unwrap()
        });
    });
    group.bench_function("get_messages_50", |b| {
        b.to_async(&rt).iter(|| async {
            fixture
                .messages
                .get_messages(fixture.conversation_id, 2, 50, None)
                .await
                .unwrap()
        });
    });
    group.bench_function("list_conversations", |b| {
        b.to_async(&rt).iter(|| async {
            fixture.conversations.list_conversations(2).await.unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_eligibility, bench_fanout, bench_send_message);
criterion_main!(benches);
