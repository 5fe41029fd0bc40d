//! End-to-end codec scenarios.

use super::*;
use crate::BwError;

fn l2(data: &[f32]) -> f64 {
    data.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt()
}

fn l2_diff(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn snr_db(orig: &[f32], recon: &[f32]) -> f64 {
    20.0 * (l2(orig) / l2_diff(orig, recon)).log10()
}

fn one_thread() -> CodecOptions {
    CodecOptions { threads: 1 }
}

#[test]
fn test_trivial_all_zero_volume() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol = vec![0.0f32; dims.cells()];

    let (bytes, stats) = compress(0.01, &vol, dims, blk, &one_thread()).unwrap();
    // Header (32) + one table entry (8) + a single zero-run token (3).
    assert_eq!(stats.compressed_len, HEADER_BYTES + 8 + 3);
    assert_eq!(bytes.len(), stats.compressed_len);
    assert_eq!(stats.global_rms, 0.0);

    let (recon, rdims) = decompress(&bytes, &one_thread()).unwrap();
    assert_eq!(rdims, dims);
    assert!(recon.iter().all(|&v| v == 0.0));
}

#[test]
fn test_constant_volume_bound() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol = vec![1.0f32; dims.cells()];
    let scale = 0.01;

    let (bytes, _) = compress(scale, &vol, dims, blk, &CodecOptions::default()).unwrap();
    let (recon, _) = decompress(&bytes, &CodecOptions::default()).unwrap();
    let rel = l2_diff(&vol, &recon) / l2(&vol);
    assert!(rel <= 4.0 * scale as f64, "rel error {}", rel);
}

#[test]
fn test_sinusoid_along_x() {
    let dims = VolumeDims::new(160, 96, 64);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| {
            let x = (i % dims.nx) as f64;
            (10.0 * std::f64::consts::PI * x / dims.nx as f64).sin() as f32
        })
        .collect();

    let (bytes, stats) = compress(0.01, &vol, dims, blk, &CodecOptions::default()).unwrap();
    assert!(stats.ratio >= 50.0, "ratio {}", stats.ratio);

    let (recon, _) = decompress(&bytes, &CodecOptions::default()).unwrap();
    let snr = snr_db(&vol, &recon);
    assert!(snr >= 40.0, "SNR {} dB", snr);
}

// The full-size variant of the sinusoid scenario; slow, so opt-in.
#[test]
#[ignore]
fn test_sinusoid_full_size() {
    let dims = VolumeDims::new(320, 416, 352);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| {
            let x = (i % dims.nx) as f64;
            (10.0 * std::f64::consts::PI * x / dims.nx as f64).sin() as f32
        })
        .collect();

    let (bytes, stats) = compress(0.01, &vol, dims, blk, &CodecOptions::default()).unwrap();
    assert!(stats.ratio >= 50.0, "ratio {}", stats.ratio);
    let (recon, _) = decompress(&bytes, &CodecOptions::default()).unwrap();
    assert!(snr_db(&vol, &recon) >= 40.0);
}

#[test]
fn test_non_multiple_dimensions() {
    let dims = VolumeDims::new(37, 41, 43);
    let blk = BlockDims::new(8, 8, 8).unwrap();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| ((i * 2654435761) % 1000) as f32 / 500.0 - 1.0)
        .collect();
    let scale = 0.01;

    let (bytes, _) = compress(scale, &vol, dims, blk, &CodecOptions::default()).unwrap();
    let (recon, rdims) = decompress(&bytes, &CodecOptions::default()).unwrap();
    assert_eq!(rdims, dims);
    assert_eq!(recon.len(), vol.len());
    let rel = l2_diff(&vol, &recon) / l2(&vol);
    assert!(rel <= 4.0 * scale as f64, "rel error {}", rel);
}

#[test]
fn test_invalid_block_size_refused() {
    let dims = VolumeDims::new(32, 32, 32);
    let vol = vec![0.0f32; dims.cells()];
    let blk = BlockDims {
        bx: 24,
        by: 32,
        bz: 32,
    };
    let mut out = vec![0u8; 1 << 20];
    let before = out.clone();
    let err = compress_into(0.1, &vol, dims, blk, &mut out, &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::InvalidBlockSize { axis: 'x', size: 24 }));
    // Refused without side effects.
    assert_eq!(out, before);
}

#[test]
fn test_undersized_output_refused() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol = vec![0.0f32; dims.cells()];
    let mut out = vec![0u8; 64];
    let err = compress_into(0.1, &vol, dims, blk, &mut out, &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::BufferTooSmall { .. }));
}

#[test]
fn test_nan_input_is_fatal() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let mut vol = vec![1.0f32; dims.cells()];
    vol[100] = f32::INFINITY;
    let err = compress(0.1, &vol, dims, blk, &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::NonFiniteInput { index: 100 }));
}

#[test]
fn test_round_trip_bound_random_volume() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let dims = VolumeDims::new(64, 48, 40);
    let blk = BlockDims::new(16, 16, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    // Smooth-ish field: random low-frequency mix, not white noise.
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| {
            let x = (i % dims.nx) as f32;
            let y = ((i / dims.nx) % dims.ny) as f32;
            (x * 0.2).sin() + (y * 0.15).cos() + rng.gen_range(-0.05f32..0.05)
        })
        .collect();

    for scale in [0.1f32, 0.01, 0.001] {
        let (bytes, _) = compress(scale, &vol, dims, blk, &CodecOptions::default()).unwrap();
        let (recon, _) = decompress(&bytes, &CodecOptions::default()).unwrap();
        let rel = l2_diff(&vol, &recon) / l2(&vol);
        assert!(
            rel <= 4.0 * scale as f64,
            "scale {}: rel error {}",
            scale,
            rel
        );
    }
}

#[test]
fn test_thread_count_does_not_change_result() {
    let dims = VolumeDims::new(48, 40, 24);
    let blk = BlockDims::new(8, 8, 8).unwrap();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| ((i as f32) * 0.37).sin())
        .collect();

    let (b1, s1) = compress(0.02, &vol, dims, blk, &one_thread()).unwrap();
    let (b8, s8) = compress(0.02, &vol, dims, blk, &CodecOptions { threads: 8 }).unwrap();
    assert_eq!(s1.compressed_len, s8.compressed_len);

    // Arena record order may differ between runs, but the decoded volume
    // must be bit-identical.
    let (r1, _) = decompress(&b1, &one_thread()).unwrap();
    let (r8, _) = decompress(&b8, &CodecOptions { threads: 8 }).unwrap();
    assert_eq!(r1, r8);
}

#[test]
fn test_multi_block_staging_flushes() {
    // Small blocks give 2^18 / 512 = 512 records per staging area;
    // 4096 blocks across a few workers forces mid-run arena appends,
    // not just the final residual flush.
    let dims = VolumeDims::new(128, 128, 128);
    let blk = BlockDims::new(8, 8, 8).unwrap();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| ((i % 97) as f32) * 0.1)
        .collect();
    let (bytes, _) = compress(0.01, &vol, dims, blk, &CodecOptions { threads: 4 }).unwrap();
    let (recon, _) = decompress(&bytes, &CodecOptions { threads: 4 }).unwrap();
    let rel = l2_diff(&vol, &recon) / l2(&vol);
    assert!(rel <= 0.04, "rel error {}", rel);
}

/// Build a compressed stream by hand where every block record is raw.
/// The encoder's token grammar never overflows its budget in practice,
/// but the format allows raw records and the decoder must honour them.
#[test]
fn test_all_raw_stream_decodes_exactly() {
    let dims = VolumeDims::new(16, 16, 16);
    let blk = BlockDims::new(8, 8, 8).unwrap();
    let grid = BlockGrid::of(dims, blk);
    let bsize = blk.cells();
    let vol: Vec<f32> = (0..dims.cells())
        .map(|i| ((i as f32) * 0.013).cos())
        .collect();

    let xf = wavelet::Wavelet3d::new();
    let mut tmp = vec![0.0f32; wavelet::scratch_len(8, 8, 8)];

    let mut bytes = vec![0u8; max_compressed_len(dims, blk)];
    super::write_header(&mut bytes, dims, blk, 1.0);
    let table_start = HEADER_BYTES;
    let arena_start = table_start + 8 * grid.count();

    let mut work = vec![0.0f32; bsize];
    for iblk in 0..grid.count() {
        let (ix, iy, iz) = grid.coords(iblk);
        super::blocks::copy_to_block(&vol, ix * 8, iy * 8, iz * 8, dims, &mut work, blk);
        xf.forward(&mut work, 8, 8, 8, &mut tmp);
        let offset = iblk * bsize * 4;
        let stored = -((offset as i64) + 1);
        bytes[table_start + 8 * iblk..table_start + 8 * iblk + 8]
            .copy_from_slice(&stored.to_le_bytes());
        for (i, &v) in work.iter().enumerate() {
            let at = arena_start + offset + i * 4;
            bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
    let total = arena_start + grid.count() * bsize * 4;
    bytes.truncate(total);

    // All-raw size: header + table + every block at 4 bytes per cell.
    assert_eq!(
        total,
        HEADER_BYTES + 8 * grid.count() + grid.count() * bsize * 4
    );

    let (recon, rdims) = decompress(&bytes, &CodecOptions::default()).unwrap();
    assert_eq!(rdims, dims);
    // Raw records skip quantisation entirely; only transform rounding
    // remains.
    let rel = l2_diff(&vol, &recon) / l2(&vol);
    assert!(rel < 1e-5, "rel error {}", rel);
}

#[test]
fn test_corrupt_offset_rejected() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol = vec![1.0f32; dims.cells()];
    let (mut bytes, _) = compress(0.1, &vol, dims, blk, &one_thread()).unwrap();

    // Point the only block's record far outside the arena.
    let stored: i64 = 1 << 40;
    bytes[HEADER_BYTES..HEADER_BYTES + 8].copy_from_slice(&stored.to_le_bytes());
    let err = decompress(&bytes, &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::Corrupt(_)));
}

#[test]
fn test_corrupt_header_rejected() {
    let err = decompress(&[0u8; 8], &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::Corrupt(_)));

    // Valid length, nonsense block dims.
    let mut bytes = vec![0u8; 64];
    bytes[0..4].copy_from_slice(&32u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&32u32.to_le_bytes());
    bytes[8..12].copy_from_slice(&32u32.to_le_bytes());
    bytes[12..16].copy_from_slice(&7u32.to_le_bytes());
    let err = decompress(&bytes, &one_thread()).unwrap_err();
    assert!(matches!(err, BwError::Corrupt(_)));
}

#[test]
fn test_ratio_reflects_buffer_sizes() {
    let dims = VolumeDims::new(32, 32, 32);
    let blk = BlockDims::new(32, 32, 32).unwrap();
    let vol = vec![0.0f32; dims.cells()];
    let (_, stats) = compress(0.01, &vol, dims, blk, &one_thread()).unwrap();
    let expect = (dims.cells() * 4) as f32 / stats.compressed_len as f32;
    assert_eq!(stats.ratio, expect);
}
