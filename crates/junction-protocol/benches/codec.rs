//! Codec benchmarks for junction-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use junction_protocol::messages::Publish;
use junction_protocol::{codec, Message, Serialization};
use serde_json::json;

fn event_publish(len: usize) -> Message {
    Message::Publish(Publish {
        request: 1,
        topic: "com.example.ticker".into(),
        arguments: vec![json!("x".repeat(len))],
        ..Default::default()
    })
}

fn bench_encode(c: &mut Criterion) {
    let message = event_publish(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode(black_box(&message), Serialization::Json))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::encode(black_box(&message), Serialization::MsgPack))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let message = event_publish(64);
    let json = codec::encode(&message, Serialization::Json).unwrap();
    let msgpack = codec::encode(&message, Serialization::MsgPack).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode(black_box(&json), Serialization::Json))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode(black_box(&msgpack), Serialization::MsgPack))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let message = event_publish(256);

    c.bench_function("roundtrip_msgpack_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&message), Serialization::MsgPack).unwrap();
            codec::decode(black_box(&encoded), Serialization::MsgPack).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
