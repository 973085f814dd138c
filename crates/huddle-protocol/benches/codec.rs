//! Codec benchmarks for huddle-protocol.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, InboundFrame, OutboundFrame, SenderInfo};

fn outbound(content_len: usize) -> OutboundFrame {
    OutboundFrame {
        id: 42,
        conversation_id: Some(7),
        sender_id: 1,
        sender: SenderInfo {
            id: 1,
            username: "alice".into(),
            display_name: Some("Alice".into()),
        },
        team_id: None,
        recipient_id: None,
        content: "x".repeat(content_len),
        created_at: Utc::now(),
    }
}

fn bench_encode_outbound(c: &mut Criterion) {
    let frame = outbound(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("outbound_64B", |b| {
        b.iter(|| codec::encode_outbound(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_inbound(c: &mut Criterion) {
    let encoded =
        serde_json::to_vec(&InboundFrame::to_conversation(7, "x".repeat(256))).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("inbound_256B", |b| {
        b.iter(|| codec::decode_inbound(black_box(&encoded)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode_outbound, bench_decode_inbound);
criterion_main!(benches);
