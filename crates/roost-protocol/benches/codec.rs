//! Codec benchmarks for roost-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roost_protocol::{codec, Packet};

fn bench_encode_small(c: &mut Criterion) {
    let packet = Packet::publish("sensors/kitchen/temp", vec![0u8; 64]);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("publish_64B", |b| {
        b.iter(|| codec::encode(black_box(&packet)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let packet = Packet::publish("sensors/kitchen/temp", vec![0u8; 64]);
    let encoded = codec::encode(&packet).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("publish_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_streaming_decode(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for i in 0..64u16 {
        codec::encode_into(&Packet::subscribe(i, ["a/+/c"]), &mut stream).unwrap();
        codec::encode_into(&Packet::PingReq, &mut stream).unwrap();
    }
    let stream = stream.freeze();

    c.bench_function("decode_from_128_packets", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut count = 0;
            while let Ok(Some(packet)) = codec::decode_from(&mut buf) {
                black_box(packet);
                count += 1;
            }
            count
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_streaming_decode
);
criterion_main!(benches);
