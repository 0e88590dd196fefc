use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use meshnet_audio::audio::{AudioFormat, ItemBuffer, JitterBuffer, RingBuffer, StreamBuffer};

fn stream_buffer(c: &mut Criterion) {
    let frame_bytes = AudioFormat::default().frame_bytes();
    let mut group = c.benchmark_group("stream_buffer");
    group.throughput(Throughput::Bytes(frame_bytes as u64));

    for chunks in [1usize, 4, 16] {
        let buffer = StreamBuffer::new(frame_bytes * 4).unwrap();
        let chunk = vec![0x5Au8; frame_bytes / chunks];
        let mut out = vec![0u8; frame_bytes];
        group.bench_with_input(BenchmarkId::new("write_read_frame", chunks), &chunks, |b, &chunks| {
            b.iter(|| {
                for _ in 0..chunks {
                    buffer.write(black_box(&chunk)).unwrap();
                }
                buffer.read(&mut out).unwrap();
            })
        });
    }
    group.finish();
}

fn item_buffer(c: &mut Criterion) {
    let buffer = ItemBuffer::new(512 * 8).unwrap();
    let item = vec![0xA5u8; 160];
    c.bench_function("item_buffer/write_receive", |b| {
        b.iter(|| {
            buffer.write(black_box(&item)).unwrap();
            let received = buffer.receive_item().unwrap();
            black_box(received.len());
            received.release();
        })
    });
}

fn jitter_buffer(c: &mut Criterion) {
    let frame_bytes = AudioFormat::default().frame_bytes();
    let jitter = JitterBuffer::new(frame_bytes, 2, 3).unwrap();
    let frame = vec![1u8; frame_bytes];
    let mut out = vec![0u8; frame_bytes];
    jitter.push(&frame).unwrap();
    jitter.push(&frame).unwrap();

    c.bench_function("jitter_buffer/push_pop", |b| {
        b.iter(|| {
            jitter.push(black_box(&frame)).unwrap();
            black_box(jitter.pop(&mut out));
        })
    });
}

criterion_group!(benches, stream_buffer, item_buffer, jitter_buffer);
criterion_main!(benches);
