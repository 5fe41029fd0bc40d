//! Parallel block scheduler for compression and decompression.
//!
//! Workers claim block indices from a shared atomic cursor and run the
//! whole per-block pipeline (copy, transform, quantise/encode) into a
//! private staging area. When the staging area holds
//! `max(1, 2^18 / block_cells)` records, the worker takes the arena
//! mutex once, reserves that many bytes, publishes the staged blocks'
//! offsets into the table and stream-copies the staged bytes into the
//! arena with non-temporal stores. A final flush drains each worker's
//! residue. The mutex-guarded cursor is the only mutable global state;
//! everything a worker writes outside its own staging area is a region
//! it has exclusively reserved.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::blocks::{copy_from_block_raw, copy_to_block};
use super::{rle, wavelet, BlockDims, BlockGrid, Header, VolumeDims, HEADER_BYTES};
use crate::simd::Dispatcher;
use crate::{BwError, BwResult};

/// Staged-record budget: one arena append per ~256 KiB of block payload.
const STAGING_BYTES: usize = 1 << 18;

/// Shared raw view of the output buffer.
///
/// Workers write only into regions they own: the 8-byte table slot of a
/// block they claimed, or an arena span they reserved under the cursor
/// mutex. The wrapper exists to move the pointer across threads.
struct SharedOut {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: all writes through `ptr` go to disjoint regions (see struct
// docs); the pointed-to buffer outlives the thread scope.
unsafe impl Send for SharedOut {}
unsafe impl Sync for SharedOut {}

struct StagedRecord {
    block: usize,
    offset: usize,
    len: usize,
    raw: bool,
}

pub(crate) fn compress_blocks(
    vol: &[f32],
    dims: VolumeDims,
    blk: BlockDims,
    grid: BlockGrid,
    mulfac: f32,
    out: &mut [u8],
    threads: usize,
) -> BwResult<usize> {
    let nnn = grid.count();
    let bsize = blk.cells();
    let budget = bsize * 4;
    let priv_len = (STAGING_BYTES / bsize).max(1);
    let arena_start = HEADER_BYTES + 8 * nnn;

    let shared = SharedOut {
        ptr: out.as_mut_ptr(),
        len: out.len(),
    };
    let cursor = Mutex::new(0usize);
    let next_block = AtomicUsize::new(0);
    let workers = threads.min(nnn).max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let shared = &shared;
            let cursor = &cursor;
            let next_block = &next_block;
            scope.spawn(move || {
                let xf = wavelet::Wavelet3d::new();
                let dispatcher = Dispatcher::new();
                let mut work = vec![0.0f32; bsize];
                let mut tmp = vec![0.0f32; wavelet::scratch_len(blk.bx, blk.by, blk.bz)];
                let mut staging = vec![0u8; priv_len * budget];
                let mut records: Vec<StagedRecord> = Vec::with_capacity(priv_len);
                let mut staged = 0usize;

                loop {
                    let iblk = next_block.fetch_add(1, Ordering::Relaxed);
                    if iblk >= nnn {
                        break;
                    }
                    let (ix, iy, iz) = grid.coords(iblk);
                    copy_to_block(
                        vol,
                        ix * blk.bx,
                        iy * blk.by,
                        iz * blk.bz,
                        dims,
                        &mut work,
                        blk,
                    );
                    xf.forward(&mut work, blk.bx, blk.by, blk.bz, &mut tmp);

                    let dst = &mut staging[staged..staged + budget];
                    match rle::encode(mulfac, &work, dst) {
                        Some(len) => {
                            records.push(StagedRecord {
                                block: iblk,
                                offset: staged,
                                len,
                                raw: false,
                            });
                            staged += len;
                        }
                        None => {
                            // Raw fallback: transformed coefficients verbatim.
                            for (i, &v) in work.iter().enumerate() {
                                dst[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
                            }
                            records.push(StagedRecord {
                                block: iblk,
                                offset: staged,
                                len: budget,
                                raw: true,
                            });
                            staged += budget;
                        }
                    }

                    if records.len() >= priv_len {
                        flush_staging(
                            shared,
                            cursor,
                            arena_start,
                            &staging[..staged],
                            &records,
                            &dispatcher,
                        );
                        records.clear();
                        staged = 0;
                    }
                }

                if !records.is_empty() {
                    flush_staging(
                        shared,
                        cursor,
                        arena_start,
                        &staging[..staged],
                        &records,
                        &dispatcher,
                    );
                }
            });
        }
    });

    let arena_len = *cursor.lock().unwrap_or_else(|e| e.into_inner());
    debug_assert!(arena_start + arena_len <= shared.len);
    Ok(arena_len)
}

/// Reserve a span under the cursor mutex, publish offsets, stream-copy.
fn flush_staging(
    shared: &SharedOut,
    cursor: &Mutex<usize>,
    arena_start: usize,
    staged: &[u8],
    records: &[StagedRecord],
    dispatcher: &Dispatcher,
) {
    let base = {
        let mut cur = cursor.lock().unwrap_or_else(|e| e.into_inner());
        let base = *cur;
        *cur += staged.len();
        base
    };

    for rec in records {
        // Sign encodes raw vs coded; magnitude is the arena offset plus
        // one so a raw record at offset zero keeps its sign.
        let magnitude = (base + rec.offset) as i64 + 1;
        let stored = if rec.raw { -magnitude } else { magnitude };
        let slot = HEADER_BYTES + 8 * rec.block;
        // SAFETY: this worker claimed `rec.block` from the atomic cursor,
        // so no other thread writes this table slot; the slot lies inside
        // the output buffer (table precedes the arena).
        unsafe {
            std::ptr::copy_nonoverlapping(
                stored.to_le_bytes().as_ptr(),
                shared.ptr.add(slot),
                8,
            );
        }
    }

    let dst_off = arena_start + base;
    debug_assert!(dst_off + staged.len() <= shared.len);
    // SAFETY: the cursor reservation above makes
    // [dst_off, dst_off + staged.len()) exclusive to this worker, and the
    // span lies inside the output buffer (the caller sized it for the
    // all-raw worst case).
    let dst = unsafe { std::slice::from_raw_parts_mut(shared.ptr.add(dst_off), staged.len()) };
    dispatcher.stream_copy(dst, staged);
}

/// Shared raw view of the output volume for decompression.
///
/// Distinct blocks scatter into disjoint grid tiles, so workers never
/// write the same cell.
struct SharedVol {
    ptr: *mut f32,
}

// SAFETY: disjoint tile writes only; the volume outlives the scope.
unsafe impl Send for SharedVol {}
unsafe impl Sync for SharedVol {}

pub(crate) fn decompress_blocks(
    bytes: &[u8],
    header: &Header,
    threads: usize,
) -> BwResult<Vec<f32>> {
    let dims = header.dims;
    let blk = header.blk;
    let grid = header.grid;
    let nnn = grid.count();
    let bsize = blk.cells();
    let arena = &bytes[header.arena_start..];

    let mut vol = vec![0.0f32; dims.cells()];
    let shared = SharedVol {
        ptr: vol.as_mut_ptr(),
    };
    let next_block = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<BwError>> = Mutex::new(None);
    let workers = threads.min(nnn).max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let shared = &shared;
            let next_block = &next_block;
            let failed = &failed;
            let first_error = &first_error;
            scope.spawn(move || {
                let xf = wavelet::Wavelet3d::new();
                let mut work = vec![0.0f32; bsize];
                let mut tmp = vec![0.0f32; wavelet::scratch_len(blk.bx, blk.by, blk.bz)];

                loop {
                    if failed.load(Ordering::Relaxed) {
                        break;
                    }
                    let iblk = next_block.fetch_add(1, Ordering::Relaxed);
                    if iblk >= nnn {
                        break;
                    }
                    if let Err(e) =
                        decode_one_block(bytes, header, arena, iblk, &xf, &mut work, &mut tmp)
                    {
                        failed.store(true, Ordering::Relaxed);
                        let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                        slot.get_or_insert(e);
                        break;
                    }
                    let (ix, iy, iz) = grid.coords(iblk);
                    // SAFETY: block tiles are disjoint; each cell of the
                    // volume is written by exactly one block.
                    unsafe {
                        copy_from_block_raw(
                            &work,
                            blk,
                            shared.ptr,
                            ix * blk.bx,
                            iy * blk.by,
                            iz * blk.bz,
                            dims,
                        );
                    }
                }
            });
        }
    });

    if let Some(e) = first_error
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take()
    {
        return Err(e);
    }
    Ok(vol)
}

/// Decode one block record into `work` (inverse-transformed).
fn decode_one_block(
    bytes: &[u8],
    header: &Header,
    arena: &[u8],
    iblk: usize,
    xf: &wavelet::Wavelet3d,
    work: &mut [f32],
    tmp: &mut [f32],
) -> BwResult<()> {
    let blk = header.blk;
    let bsize = blk.cells();
    let slot = header.table_start + 8 * iblk;
    let stored = i64::from_le_bytes(
        bytes[slot..slot + 8]
            .try_into()
            .map_err(|_| BwError::Corrupt("offset table truncated"))?,
    );
    if stored == 0 {
        return Err(BwError::Corrupt("missing block record"));
    }
    let raw = stored < 0;
    let offset = (stored.unsigned_abs() - 1) as usize;
    if offset > arena.len() {
        return Err(BwError::Corrupt("block offset outside arena"));
    }

    if raw {
        let end = offset
            .checked_add(bsize * 4)
            .ok_or(BwError::Corrupt("raw record length overflows"))?;
        if end > arena.len() {
            return Err(BwError::Corrupt("raw record exceeds arena"));
        }
        for (i, v) in work.iter_mut().enumerate() {
            let at = offset + i * 4;
            *v = f32::from_le_bytes([
                arena[at],
                arena[at + 1],
                arena[at + 2],
                arena[at + 3],
            ]);
        }
    } else {
        rle::decode(header.mulfac, &arena[offset..], work)?;
    }
    xf.inverse(work, blk.bx, blk.by, blk.bz, tmp);
    Ok(())
}
