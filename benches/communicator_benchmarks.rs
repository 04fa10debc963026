//! Communicator benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_communicator::{frame, FrameDecoder, Packet, SendingQueue};

fn framing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for size in [64, 1024, 16384] {
        group.throughput(Throughput::Bytes(size as u64));

        // Every tenth byte starts a marker so escaping is exercised
        let payload: String = (0..size)
            .map(|i| if i % 10 == 0 { '[' } else { 'a' })
            .collect::<String>()
            .replace("[aaaaa", "[FLAG]");
        let packet = Packet::broadcast(payload, "screenshare");

        group.bench_with_input(BenchmarkId::new("frame", size), &packet, |b, packet| {
            b.iter(|| frame(packet).unwrap());
        });

        let framed = frame(&packet).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &framed, |b, framed| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.extend(framed.as_bytes());
                decoder.decode().unwrap().unwrap()
            });
        });
    }

    group.finish();
}

fn sending_queue_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sending_queue");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("enqueue_dequeue_1000", |b| {
        let queue = SendingQueue::default();
        queue.register_module("chat", true);
        queue.register_module("whiteboard", false);

        b.iter(|| {
            for i in 0..500 {
                queue.enqueue(Packet::broadcast("x", "chat"));
                queue.enqueue(Packet::unicast("y", "whiteboard", i.to_string()));
            }
            while queue.dequeue().is_some() {}
        });
    });

    group.finish();
}

criterion_group!(benches, framing_benchmark, sending_queue_benchmark);
criterion_main!(benches);
