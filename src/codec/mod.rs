//! Lossy block-wavelet codec for dense 3-D `f32` volumes.
//!
//! The volume is tiled into power-of-two blocks. Each block is copied
//! into a scratch (zero-padded at the volume edge), run through the 3-D
//! lifting wavelet, quantised against the volume's global RMS and
//! run-length encoded. Blocks whose encoding would exceed the raw block
//! size are stored raw (transformed coefficients verbatim) instead —
//! the fallback bounds the output and guarantees termination.
//!
//! **Compressed stream layout (little-endian 32-bit words):**
//!
//! | Word offset          | Field                                     |
//! |----------------------|-------------------------------------------|
//! | 0..2                 | nx, ny, nz                                |
//! | 3..5                 | bx, by, bz                                |
//! | 6                    | mulfac (f32 bit pattern)                  |
//! | 7                    | reserved = 0                              |
//! | 8                    | offset table: one i64 per block, z-major  |
//! | 8 + 2·nblocks        | byte arena: concatenated block records    |
//!
//! A table entry is signed: negative means the record is raw (`bx·by·bz`
//! f32 words), positive means a token stream. The magnitude is the arena
//! byte offset biased by one, so the sign stays meaningful for a record
//! at arena offset zero.
//!
//! Compression is deterministic in content: block records land in the
//! arena in whatever order worker threads publish them, but the offset
//! table always maps each block to its canonical grid position. With one
//! thread the byte stream is fully reproducible.

pub(crate) mod blocks;
mod parallel;
pub mod rle;
pub mod wavelet;

#[cfg(test)]
mod tests;

use crate::simd::Dispatcher;
use crate::{resolve_thread_count, BwError, BwResult};

/// Smallest supported block extent.
pub const MIN_BLOCK: usize = 8;
/// Largest supported block extent.
pub const MAX_BLOCK: usize = 256;

/// Header length in bytes (8 little-endian 32-bit words).
pub(crate) const HEADER_BYTES: usize = 32;

/// Fixed reduction span for the global RMS pass. Partial sums are folded
/// in span order, so the result is bit-stable across thread counts.
const RMS_CHUNK: usize = 1 << 16;

/// Volume extents; x is the fastest axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDims {
    /// Extent along the fastest axis.
    pub nx: usize,
    /// Extent along the middle axis.
    pub ny: usize,
    /// Extent along the slowest axis.
    pub nz: usize,
}

impl VolumeDims {
    /// Bundle volume extents.
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        VolumeDims { nx, ny, nz }
    }

    /// Total cell count.
    pub fn cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }
}

/// Block extents; validated powers of two in `[MIN_BLOCK, MAX_BLOCK]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDims {
    /// Block extent along x.
    pub bx: usize,
    /// Block extent along y.
    pub by: usize,
    /// Block extent along z.
    pub bz: usize,
}

impl BlockDims {
    /// Validate and bundle block extents.
    pub fn new(bx: usize, by: usize, bz: usize) -> BwResult<Self> {
        for (axis, size) in [('x', bx), ('y', by), ('z', bz)] {
            if !size.is_power_of_two() || !(MIN_BLOCK..=MAX_BLOCK).contains(&size) {
                return Err(BwError::InvalidBlockSize { axis, size });
            }
        }
        Ok(BlockDims { bx, by, bz })
    }

    /// Cells per block.
    pub fn cells(&self) -> usize {
        self.bx * self.by * self.bz
    }
}

/// Options controlling compression and decompression.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Number of worker threads. 0 = auto (all available cores).
    pub threads: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions { threads: 0 }
    }
}

/// Result of a compression run.
#[derive(Debug, Clone, Copy)]
pub struct CompressStats {
    /// Total compressed length in bytes (header + table + arena).
    pub compressed_len: usize,
    /// Uncompressed size over compressed size.
    pub ratio: f32,
    /// The global RMS the quantiser was normalised against.
    pub global_rms: f32,
}

/// Number of blocks along each axis and in total.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockGrid {
    pub nbx: usize,
    pub nby: usize,
    pub nbz: usize,
}

impl BlockGrid {
    pub(crate) fn of(dims: VolumeDims, blk: BlockDims) -> Self {
        BlockGrid {
            nbx: dims.nx.div_ceil(blk.bx),
            nby: dims.ny.div_ceil(blk.by),
            nbz: dims.nz.div_ceil(blk.bz),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.nbx * self.nby * self.nbz
    }

    /// Grid coordinates of a z-major linearised block index.
    pub(crate) fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let iz = idx / (self.nbx * self.nby);
        let rem = idx - iz * self.nbx * self.nby;
        let iy = rem / self.nbx;
        let ix = rem - iy * self.nbx;
        (ix, iy, iz)
    }
}

/// Worst-case compressed length: header, offset table and an all-raw
/// arena. `compress_into` requires an output buffer of at least this size.
pub fn max_compressed_len(dims: VolumeDims, blk: BlockDims) -> usize {
    let grid = BlockGrid::of(dims, blk);
    HEADER_BYTES + 8 * grid.count() + grid.count() * blk.cells() * 4
}

/// Compress `vol` into `out`, returning the stats.
///
/// `out` must hold at least [`max_compressed_len`] bytes; `scale` is the
/// target relative distortion (0 < scale ≤ 1 typical). Fails with a
/// Validation error — before any side effect — on invalid block sizes,
/// mismatched volume length or an undersized output buffer, and with a
/// Numerical error if the volume contains NaN or Inf.
pub fn compress_into(
    scale: f32,
    vol: &[f32],
    dims: VolumeDims,
    blk: BlockDims,
    out: &mut [u8],
    options: &CodecOptions,
) -> BwResult<CompressStats> {
    validate_dims(dims, blk)?;
    if vol.len() != dims.cells() {
        return Err(BwError::InvalidVolumeDims {
            axis: 'x',
            size: vol.len(),
        });
    }
    let required = max_compressed_len(dims, blk);
    if out.len() < required {
        return Err(BwError::BufferTooSmall {
            required,
            provided: out.len(),
        });
    }

    let threads = resolve_thread_count(options.threads);
    let global_rms = global_rms(vol, threads)?;
    let mulfac = if global_rms > 0.0 {
        1.0 / (scale * global_rms)
    } else {
        0.0
    };

    let grid = BlockGrid::of(dims, blk);
    write_header(out, dims, blk, mulfac);

    let arena_len = parallel::compress_blocks(vol, dims, blk, grid, mulfac, out, threads)?;

    let compressed_len = HEADER_BYTES + 8 * grid.count() + arena_len;
    let uncompressed = dims.cells() * 4;
    Ok(CompressStats {
        compressed_len,
        ratio: uncompressed as f32 / compressed_len as f32,
        global_rms,
    })
}

/// Compress into a freshly allocated buffer, truncated to the
/// compressed length.
pub fn compress(
    scale: f32,
    vol: &[f32],
    dims: VolumeDims,
    blk: BlockDims,
    options: &CodecOptions,
) -> BwResult<(Vec<u8>, CompressStats)> {
    let mut out = vec![0u8; max_compressed_len(dims, blk)];
    let stats = compress_into(scale, vol, dims, blk, &mut out, options)?;
    out.truncate(stats.compressed_len);
    Ok((out, stats))
}

/// Decompress a stream produced by [`compress`].
///
/// Self-describing: only the byte stream is needed. Any inconsistency
/// (short header, invalid dims, out-of-range offsets, records overrunning
/// the arena) is a Corrupt error.
pub fn decompress(bytes: &[u8], options: &CodecOptions) -> BwResult<(Vec<f32>, VolumeDims)> {
    let header = parse_header(bytes)?;
    let threads = resolve_thread_count(options.threads);
    let vol = parallel::decompress_blocks(bytes, &header, threads)?;
    Ok((vol, header.dims))
}

fn validate_dims(dims: VolumeDims, blk: BlockDims) -> BwResult<()> {
    // BlockDims::new already vetted the block; re-check here so a
    // hand-rolled struct literal cannot sneak past validation.
    BlockDims::new(blk.bx, blk.by, blk.bz)?;
    for (axis, n, b) in [
        ('x', dims.nx, blk.bx),
        ('y', dims.ny, blk.by),
        ('z', dims.nz, blk.bz),
    ] {
        if n < b {
            return Err(BwError::InvalidVolumeDims { axis, size: n });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub dims: VolumeDims,
    pub blk: BlockDims,
    pub mulfac: f32,
    pub grid: BlockGrid,
    /// Byte offset of the offset table.
    pub table_start: usize,
    /// Byte offset of the arena.
    pub arena_start: usize,
}

fn write_header(out: &mut [u8], dims: VolumeDims, blk: BlockDims, mulfac: f32) {
    let words: [u32; 8] = [
        dims.nx as u32,
        dims.ny as u32,
        dims.nz as u32,
        blk.bx as u32,
        blk.by as u32,
        blk.bz as u32,
        mulfac.to_bits(),
        0,
    ];
    for (i, w) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
}

fn parse_header(bytes: &[u8]) -> BwResult<Header> {
    if bytes.len() < HEADER_BYTES {
        return Err(BwError::Corrupt("stream shorter than header"));
    }
    let word = |i: usize| {
        u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
    };
    let dims = VolumeDims::new(word(0) as usize, word(1) as usize, word(2) as usize);
    let (bx, by, bz) = (word(3) as usize, word(4) as usize, word(5) as usize);
    let blk = BlockDims::new(bx, by, bz).map_err(|_| BwError::Corrupt("invalid block dims"))?;
    if dims.nx == 0 || dims.ny == 0 || dims.nz == 0 {
        return Err(BwError::Corrupt("zero volume dimension"));
    }
    let mulfac = f32::from_bits(word(6));
    if !mulfac.is_finite() || mulfac < 0.0 {
        return Err(BwError::Corrupt("invalid quantisation factor"));
    }

    let grid = BlockGrid::of(dims, blk);
    let table_start = HEADER_BYTES;
    let arena_start = table_start + 8 * grid.count();
    if bytes.len() < arena_start {
        return Err(BwError::Corrupt("stream shorter than offset table"));
    }
    Ok(Header {
        dims,
        blk,
        mulfac,
        grid,
        table_start,
        arena_start,
    })
}

// ---------------------------------------------------------------------------
// Global RMS
// ---------------------------------------------------------------------------

/// One pass over the volume: `sqrt(Σ v² / n)` accumulated in f64.
///
/// The volume is cut into fixed [`RMS_CHUNK`] spans; workers claim spans
/// from an atomic cursor and the partial sums are folded in span order,
/// so the result does not depend on the thread count. A non-finite
/// partial triggers a scan of the span for the offending index.
fn global_rms(vol: &[f32], threads: usize) -> BwResult<f32> {
    use std::sync::atomic::{AtomicUsize, Ordering};

    if vol.is_empty() {
        return Ok(0.0);
    }

    let dispatcher = Dispatcher::new();
    let n_chunks = vol.len().div_ceil(RMS_CHUNK);
    let workers = threads.min(n_chunks).max(1);
    let cursor = AtomicUsize::new(0);

    let mut partials = vec![0.0f64; n_chunks];
    let mut bad_index: Option<usize> = None;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let cursor = &cursor;
            handles.push(scope.spawn(move || {
                let mut local: Vec<(usize, f64)> = Vec::new();
                let mut first_bad: Option<usize> = None;
                loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    if idx >= n_chunks {
                        break;
                    }
                    let start = idx * RMS_CHUNK;
                    let end = (start + RMS_CHUNK).min(vol.len());
                    let span = &vol[start..end];
                    let sum = dispatcher.sum_squares(span);
                    if !sum.is_finite() && first_bad.is_none() {
                        let off = span.iter().position(|v| !v.is_finite()).unwrap_or(0);
                        first_bad = Some(start + off);
                    }
                    local.push((idx, sum));
                }
                (local, first_bad)
            }));
        }
        for handle in handles {
            if let Ok((local, first_bad)) = handle.join() {
                for (idx, sum) in local {
                    partials[idx] = sum;
                }
                if let Some(i) = first_bad {
                    bad_index = Some(bad_index.map_or(i, |j| j.min(i)));
                }
            }
        }
    });

    if let Some(index) = bad_index {
        return Err(BwError::NonFiniteInput { index });
    }

    let total: f64 = partials.iter().sum();
    if !total.is_finite() {
        // Finite inputs whose squares overflow f64 cannot happen; a
        // non-finite fold without a flagged index means NaN slipped a
        // chunk boundary race, so rescan serially.
        let index = vol.iter().position(|v| !v.is_finite()).unwrap_or(0);
        return Err(BwError::NonFiniteInput { index });
    }
    Ok((total / vol.len() as f64).sqrt() as f32)
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_block_dims_validation() {
        assert!(BlockDims::new(8, 8, 8).is_ok());
        assert!(BlockDims::new(256, 8, 32).is_ok());
        assert!(matches!(
            BlockDims::new(24, 8, 8),
            Err(BwError::InvalidBlockSize { axis: 'x', size: 24 })
        ));
        assert!(BlockDims::new(8, 4, 8).is_err());
        assert!(BlockDims::new(8, 8, 512).is_err());
    }

    #[test]
    fn test_block_grid_coords_round_trip() {
        let grid = BlockGrid {
            nbx: 3,
            nby: 4,
            nbz: 5,
        };
        for idx in 0..grid.count() {
            let (ix, iy, iz) = grid.coords(idx);
            assert_eq!((iz * grid.nby + iy) * grid.nbx + ix, idx);
        }
    }

    #[test]
    fn test_global_rms_thread_count_invariant() {
        let vol: Vec<f32> = (0..300_000).map(|i| ((i % 1000) as f32) * 0.01 - 5.0).collect();
        let one = global_rms(&vol, 1).unwrap();
        let four = global_rms(&vol, 4).unwrap();
        let many = global_rms(&vol, 16).unwrap();
        assert_eq!(one.to_bits(), four.to_bits());
        assert_eq!(one.to_bits(), many.to_bits());
    }

    #[test]
    fn test_global_rms_matches_serial() {
        let vol: Vec<f32> = (0..70_000).map(|i| (i as f32).sin()).collect();
        let rms = global_rms(&vol, 4).unwrap();
        let acc: f64 = vol.iter().map(|&v| (v as f64) * (v as f64)).sum();
        let expect = (acc / vol.len() as f64).sqrt() as f32;
        assert!((rms - expect).abs() / expect < 1e-6);
    }

    #[test]
    fn test_global_rms_zero_volume() {
        let vol = vec![0.0f32; 4096];
        assert_eq!(global_rms(&vol, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_global_rms_rejects_nan() {
        let mut vol = vec![1.0f32; 70_000];
        vol[65_999] = f32::NAN;
        let err = global_rms(&vol, 4).unwrap_err();
        assert!(matches!(err, BwError::NonFiniteInput { index: 65_999 }));
    }

    #[test]
    fn test_header_round_trip() {
        let dims = VolumeDims::new(37, 41, 43);
        let blk = BlockDims::new(8, 16, 8).unwrap();
        let mut buf = vec![0u8; 64];
        write_header(&mut buf, dims, blk, 12.5);
        let h = parse_header(&buf).unwrap();
        assert_eq!(h.dims, dims);
        assert_eq!(h.blk, blk);
        assert_eq!(h.mulfac, 12.5);
        assert_eq!(h.grid.nbx, 5);
        assert_eq!(h.table_start, HEADER_BYTES);
    }

    #[test]
    fn test_header_rejects_truncation() {
        assert!(matches!(
            parse_header(&[0u8; 16]),
            Err(BwError::Corrupt(_))
        ));
    }
}
