use blockwave::codec::wavelet::{self, Wavelet3d};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn test_block(cells: usize) -> Vec<f32> {
    (0..cells)
        .map(|i| ((i as f32) * 0.371).sin() * 100.0)
        .collect()
}

fn bench_wavelet(c: &mut Criterion) {
    let mut group = c.benchmark_group("wavelet");
    for &bs in &[8usize, 16, 32, 64] {
        let cells = bs * bs * bs;
        let data = test_block(cells);
        group.throughput(Throughput::Bytes((cells * 4) as u64));

        group.bench_with_input(
            BenchmarkId::new("forward_fast", bs),
            &data,
            |b, data| {
                let xf = Wavelet3d::new();
                let mut block = data.clone();
                let mut tmp = vec![0.0f32; wavelet::scratch_len(bs, bs, bs)];
                b.iter(|| xf.forward(&mut block, bs, bs, bs, &mut tmp));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("forward_reference", bs),
            &data,
            |b, data| {
                let mut block = data.clone();
                let mut tmp = vec![0.0f32; wavelet::scratch_len(bs, bs, bs)];
                b.iter(|| wavelet::forward_reference(&mut block, bs, bs, bs, &mut tmp));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("round_trip_fast", bs),
            &data,
            |b, data| {
                let xf = Wavelet3d::new();
                let mut block = data.clone();
                let mut tmp = vec![0.0f32; wavelet::scratch_len(bs, bs, bs)];
                b.iter(|| {
                    xf.forward(&mut block, bs, bs, bs, &mut tmp);
                    xf.inverse(&mut block, bs, bs, bs, &mut tmp);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_wavelet);
criterion_main!(benches);
