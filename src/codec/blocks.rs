//! Volume ↔ block copies.
//!
//! Blocks at the volume boundary read zeros for cells past the edge and
//! write back only the in-bounds cells. Zero fill (rather than clamped
//! replication) keeps padded coefficients from leaking energy into the
//! quantiser and is pinned by the tests.

use super::{BlockDims, VolumeDims};

/// Copy the block anchored at `(x0, y0, z0)` out of `vol` into `block`,
/// zero-filling cells that fall outside the volume.
pub(crate) fn copy_to_block(
    vol: &[f32],
    x0: usize,
    y0: usize,
    z0: usize,
    dims: VolumeDims,
    block: &mut [f32],
    blk: BlockDims,
) {
    let (nx, ny, nz) = (dims.nx, dims.ny, dims.nz);
    let (bx, by, bz) = (blk.bx, blk.by, blk.bz);
    let cx = bx.min(nx.saturating_sub(x0));

    for iz in 0..bz {
        let z = z0 + iz;
        for iy in 0..by {
            let y = y0 + iy;
            let row = &mut block[(iz * by + iy) * bx..(iz * by + iy) * bx + bx];
            if z < nz && y < ny {
                let src = (z * ny + y) * nx + x0;
                row[..cx].copy_from_slice(&vol[src..src + cx]);
                row[cx..].iter_mut().for_each(|v| *v = 0.0);
            } else {
                row.iter_mut().for_each(|v| *v = 0.0);
            }
        }
    }
}

/// Copy `block` back into `vol` at `(x0, y0, z0)`, clipped to the volume.
pub(crate) fn copy_from_block(
    block: &[f32],
    blk: BlockDims,
    vol: &mut [f32],
    x0: usize,
    y0: usize,
    z0: usize,
    dims: VolumeDims,
) {
    debug_assert!(vol.len() >= dims.cells());
    // SAFETY: exclusive access to the whole volume via `&mut`.
    unsafe { copy_from_block_raw(block, blk, vol.as_mut_ptr(), x0, y0, z0, dims) }
}

/// Raw-pointer variant of [`copy_from_block`] for the parallel scheduler,
/// where workers scatter disjoint tiles of one shared volume.
///
/// # Safety
/// `vol` must point to `dims.cells()` floats, and no other thread may
/// write the tile `[x0, x0+bx) × [y0, y0+by) × [z0, z0+bz)` (clipped to
/// the volume) while this runs.
pub(crate) unsafe fn copy_from_block_raw(
    block: &[f32],
    blk: BlockDims,
    vol: *mut f32,
    x0: usize,
    y0: usize,
    z0: usize,
    dims: VolumeDims,
) {
    let (nx, ny, nz) = (dims.nx, dims.ny, dims.nz);
    let (bx, by, bz) = (blk.bx, blk.by, blk.bz);
    let cx = bx.min(nx.saturating_sub(x0));
    let cy = by.min(ny.saturating_sub(y0));
    let cz = bz.min(nz.saturating_sub(z0));

    for iz in 0..cz {
        let z = z0 + iz;
        for iy in 0..cy {
            let y = y0 + iy;
            let src = (iz * by + iy) * bx;
            let dst = (z * ny + y) * nx + x0;
            std::ptr::copy_nonoverlapping(block.as_ptr().add(src), vol.add(dst), cx);
        }
    }
}
