//! Benchmarks for the frame codec
//!
//! Measures encode/decode cost for small control frames and large dumps, and
//! the cost of reassembling frames delivered in USB-sized chunks.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{ChecksumAlgorithm, Decoded, Frame, FrameCodec, LengthWidth, opcode};

fn benchmark_small_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_frames");
    let codec = FrameCodec::default();
    let frame = Frame::new(42, opcode::REQUEST, vec![0x01, 0x0c, 0x41, 0x35, 0x04]);

    group.bench_function("encode", |b| b.iter(|| codec.encode(black_box(&frame))));

    let bytes = codec.encode(&frame).unwrap();
    group.bench_function("decode", |b| b.iter(|| codec.decode(black_box(&bytes))));

    group.finish();
}

fn benchmark_checksums(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksums");
    let payload = vec![0xA5u8; 4000];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for algorithm in [
        ChecksumAlgorithm::Crc16,
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Xor8,
    ] {
        let codec = FrameCodec::new(LengthWidth::Two, 8192, algorithm.build());
        let frame = Frame::new(1, opcode::REQUEST, payload.clone());
        group.bench_with_input(
            BenchmarkId::new("encode", algorithm),
            &frame,
            |b, frame| b.iter(|| codec.encode(black_box(frame))),
        );
    }

    group.finish();
}

fn benchmark_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let codec = FrameCodec::default();

    let mut stream = Vec::new();
    for seq in 0..32u16 {
        stream.extend(
            codec
                .encode(&Frame::new(seq, opcode::REQUEST, vec![seq as u8; 100]))
                .unwrap(),
        );
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk in [16usize, 64, 512] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = codec.decoder();
                let mut count = 0;
                for piece in stream.chunks(chunk) {
                    decoder.extend(piece);
                    while let Ok(Decoded::Frame(_)) = decoder.decode() {
                        count += 1;
                    }
                }
                black_box(count)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_small_frames,
    benchmark_checksums,
    benchmark_reassembly
);
criterion_main!(benches);
