use blockwave::codec::{self, BlockDims, CodecOptions, VolumeDims};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// A smooth wavefield-like volume: compressible but not trivial.
fn test_volume(dims: VolumeDims) -> Vec<f32> {
    (0..dims.cells())
        .map(|i| {
            let x = (i % dims.nx) as f32;
            let y = ((i / dims.nx) % dims.ny) as f32;
            let z = (i / (dims.nx * dims.ny)) as f32;
            (x * 0.11).sin() * (y * 0.07).cos() + (z * 0.05).sin()
        })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let dims = VolumeDims::new(128, 128, 64);
    let vol = test_volume(dims);
    let bytes = (dims.cells() * 4) as u64;

    let mut group = c.benchmark_group("codec");
    group.sample_size(20);
    group.throughput(Throughput::Bytes(bytes));

    for &bs in &[16usize, 32] {
        let blk = BlockDims::new(bs, bs, bs).unwrap();

        group.bench_with_input(BenchmarkId::new("compress", bs), &vol, |b, vol| {
            let mut out = vec![0u8; codec::max_compressed_len(dims, blk)];
            let opts = CodecOptions::default();
            b.iter(|| codec::compress_into(0.01, vol, dims, blk, &mut out, &opts).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decompress", bs), &vol, |b, vol| {
            let opts = CodecOptions::default();
            let (compressed, _) = codec::compress(0.01, vol, dims, blk, &opts).unwrap();
            b.iter(|| codec::decompress(&compressed, &opts).unwrap());
        });

        group.bench_with_input(
            BenchmarkId::new("compress_single_thread", bs),
            &vol,
            |b, vol| {
                let mut out = vec![0u8; codec::max_compressed_len(dims, blk)];
                let opts = CodecOptions { threads: 1 };
                b.iter(|| codec::compress_into(0.01, vol, dims, blk, &mut out, &opts).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
