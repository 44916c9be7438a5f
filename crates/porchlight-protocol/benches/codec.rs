//! Codec benchmarks for porchlight-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use porchlight_protocol::{codec, Packet, Publish, QoS};

fn presence_publish() -> Packet {
    let mut publish = Publish::new(
        "package_exists",
        QoS::AtLeastOnce,
        br#"{"present":true,"timestamp":"2024-05-01T10:00:00Z"}"#.to_vec(),
    );
    publish.pkid = 1;
    Packet::Publish(publish)
}

fn bench_encode_publish(c: &mut Criterion) {
    let packet = presence_publish();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("presence_publish", |b| {
        b.iter(|| codec::encode(black_box(&packet)))
    });
    group.finish();
}

fn bench_decode_publish(c: &mut Criterion) {
    let encoded = codec::encode(&presence_publish()).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("presence_publish", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            codec::decode_from(black_box(&mut buf), codec::DEFAULT_MAX_PACKET_SIZE)
        })
    });
    group.finish();
}

fn bench_payload_parse(c: &mut Criterion) {
    let body = br#"{"present":true,"timestamp":"2024-05-01T10:00:00Z"}"#;

    c.bench_function("presence_payload", |b| {
        b.iter(|| {
            porchlight_protocol::decode_payload::<porchlight_protocol::PresenceReport>(black_box(
                body,
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_encode_publish,
    bench_decode_publish,
    bench_payload_parse
);
criterion_main!(benches);
