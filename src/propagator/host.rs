//! Host-side memory: the block arena, pinned staging and page pinning.
//!
//! The volume lives on the host as `NbX` blocks of width `bsX` along X,
//! full Y/Z, one set each for the particle-velocity group (PV), the
//! stress group (ST) and the earth model (EM). Blocks are page-aligned
//! and first-touched by a parallel clear so pages land on the NUMA node
//! of the thread that will stream them.
//!
//! In-block layout, x fastest:
//! `idx(y, wf, z, x) = y*(bsX*nz*nwf) + wf*(bsX*nz) + z*bsX + x`.
//!
//! Six staging slot pairs (PV/ST/EM × input/output) double-buffer the
//! CPU↔GPU path; a background worker incrementally pins host blocks —
//! PV first (most traffic), then ST, then EM — while device memory
//! leaves room. Pinned blocks skip the staging copy entirely.

use std::alloc::{alloc, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use super::device::{DeviceRuntime, HostSlab};
use crate::{BwError, BwResult};

/// Page size assumed for alignment and pinning granularity.
pub(crate) const PAGE_BYTES: usize = 4096;
const PAGE_FLOATS: usize = PAGE_BYTES / 4;

/// Safety margin left unpinned per device (bytes).
const PIN_MARGIN: u64 = 50 << 20;

/// Wavefields per PV cell (Vx, Vy, Vz and three memory variables).
pub const PV_FIELDS: usize = 6;
/// Wavefields per ST cell (txx, tyy, tzz, txy, txz, tyz).
pub const ST_FIELDS: usize = 6;
/// Packed earth-model words per cell.
pub const EM_WORDS: usize = 4;

/// Which block group a buffer or transfer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Particle-velocity wavefields.
    Pv,
    /// Stress wavefields.
    St,
    /// Earth model (read-only after load).
    Em,
}

impl GroupKind {
    /// Values stored per cell for this group.
    pub fn fields(self) -> usize {
        match self {
            GroupKind::Pv => PV_FIELDS,
            GroupKind::St => ST_FIELDS,
            GroupKind::Em => EM_WORDS,
        }
    }
}

// ---------------------------------------------------------------------------
// Page-aligned slabs
// ---------------------------------------------------------------------------

/// A page-aligned float slab with a custom allocation layout.
pub struct PageSlab {
    ptr: NonNull<f32>,
    len: usize,
    layout: Layout,
}

// SAFETY: PageSlab owns its allocation exclusively; moving it between
// threads moves ownership of the pointer.
unsafe impl Send for PageSlab {}

impl PageSlab {
    fn layout_for(floats: usize) -> Layout {
        let bytes = (floats * 4).max(PAGE_BYTES);
        let bytes = bytes.div_ceil(PAGE_BYTES) * PAGE_BYTES;
        // PAGE_BYTES is a power of two and bytes is a non-zero multiple
        // of it, so this cannot fail.
        Layout::from_size_align(bytes, PAGE_BYTES).expect("page layout")
    }

    /// Allocate and zero with `threads` workers, one page per chunk, so
    /// first touch is distributed.
    pub fn first_touch(floats: usize, threads: usize) -> Self {
        let layout = Self::layout_for(floats);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) } as *mut f32;
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        let total = layout.size() / 4;

        struct SendPtr(*mut f32);
        // SAFETY: each worker writes a disjoint range.
        unsafe impl Send for SendPtr {}
        unsafe impl Sync for SendPtr {}
        let shared = SendPtr(ptr.as_ptr());

        let workers = threads.max(1).min(total.div_ceil(PAGE_FLOATS)).max(1);
        let per = total.div_ceil(workers).div_ceil(PAGE_FLOATS) * PAGE_FLOATS;
        std::thread::scope(|scope| {
            for t in 0..workers {
                let shared = &shared;
                scope.spawn(move || {
                    let start = t * per;
                    let end = ((t + 1) * per).min(total);
                    if start < end {
                        // SAFETY: [start, end) ranges are disjoint per
                        // worker and inside the allocation.
                        unsafe {
                            std::ptr::write_bytes(shared.0.add(start), 0, end - start);
                        }
                    }
                });
            }
        });

        PageSlab { ptr, len: floats, layout }
    }

    /// Single-threaded zeroed slab for small buffers.
    pub fn zeroed(floats: usize) -> Self {
        Self::first_touch(floats, 1)
    }
}

impl Drop for PageSlab {
    fn drop(&mut self) {
        // SAFETY: allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

impl Deref for PageSlab {
    type Target = [f32];
    fn deref(&self) -> &[f32] {
        // SAFETY: len floats were allocated and initialised.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PageSlab {
    fn deref_mut(&mut self) -> &mut [f32] {
        // SAFETY: exclusive access via &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Page-chunked parallel copy between equal-length float slices.
pub(crate) fn parallel_copy(dst: &mut [f32], src: &[f32], threads: usize) {
    debug_assert_eq!(dst.len(), src.len());
    let workers = threads.max(1);
    if workers == 1 || dst.len() < PAGE_FLOATS * 2 {
        dst.copy_from_slice(src);
        return;
    }
    let per = dst.len().div_ceil(workers).div_ceil(PAGE_FLOATS) * PAGE_FLOATS;
    std::thread::scope(|scope| {
        for (d, s) in dst.chunks_mut(per).zip(src.chunks(per)) {
            scope.spawn(move || d.copy_from_slice(s));
        }
    });
}

// ---------------------------------------------------------------------------
// Host block arena
// ---------------------------------------------------------------------------

/// One host block: the slab plus its pinned flag.
pub struct HostBlock {
    /// Shared with device workers once the block is pinned.
    pub data: HostSlab,
    /// Set by the background pinning worker.
    pub pinned: Arc<AtomicBool>,
}

/// The tiled host volume: `NbX` blocks each of PV, ST and EM.
pub struct HostBlocks {
    pub bs_x: usize,
    pub nbx: usize,
    pub ny: usize,
    pub nz: usize,
    pv: Vec<HostBlock>,
    st: Vec<HostBlock>,
    em: Vec<HostBlock>,
    /// Per-block float counts, rounded up to whole pages.
    pub pv_floats: usize,
    pub st_floats: usize,
    pub em_floats: usize,
}

fn round_to_page(floats: usize) -> usize {
    floats.div_ceil(PAGE_FLOATS) * PAGE_FLOATS
}

impl HostBlocks {
    /// Allocate all blocks, first-touch cleared.
    pub fn allocate(bs_x: usize, nbx: usize, ny: usize, nz: usize, threads: usize) -> Self {
        let cells = bs_x * ny * nz;
        let pv_floats = round_to_page(cells * PV_FIELDS);
        let st_floats = round_to_page(cells * ST_FIELDS);
        let em_floats = round_to_page(cells * EM_WORDS);
        debug!(
            nbx,
            bs_x, ny, nz, pv_floats, st_floats, em_floats, "allocating host blocks"
        );

        let alloc_group = |floats: usize| -> Vec<HostBlock> {
            (0..nbx)
                .map(|_| HostBlock {
                    data: Arc::new(Mutex::new(PageSlab::first_touch(floats, threads))),
                    pinned: Arc::new(AtomicBool::new(false)),
                })
                .collect()
        };

        HostBlocks {
            bs_x,
            nbx,
            ny,
            nz,
            pv: alloc_group(pv_floats),
            st: alloc_group(st_floats),
            em: alloc_group(em_floats),
            pv_floats,
            st_floats,
            em_floats,
        }
    }

    /// The block holding X index range `[bx*bsX, (bx+1)*bsX)`.
    pub fn block(&self, kind: GroupKind, bx: usize) -> &HostBlock {
        match kind {
            GroupKind::Pv => &self.pv[bx],
            GroupKind::St => &self.st[bx],
            GroupKind::Em => &self.em[bx],
        }
    }

    /// Float count of one block of `kind`.
    pub fn floats(&self, kind: GroupKind) -> usize {
        match kind {
            GroupKind::Pv => self.pv_floats,
            GroupKind::St => self.st_floats,
            GroupKind::Em => self.em_floats,
        }
    }

    fn locate(&self, x: usize, y: usize, z: usize) -> BwResult<(usize, usize)> {
        let bx = x / self.bs_x;
        if bx >= self.nbx || y >= self.ny || z >= self.nz {
            return Err(BwError::InvalidConfig(format!(
                "cell ({}, {}, {}) outside volume",
                x, y, z
            )));
        }
        Ok((bx, x % self.bs_x))
    }

    fn cell_index(&self, nfields: usize, y: usize, wf: usize, z: usize, xi: usize) -> usize {
        let one_wf = self.bs_x * self.nz;
        y * one_wf * nfields + wf * one_wf + z * self.bs_x + xi
    }

    /// Read one wavefield value at a global cell.
    pub fn get_field(&self, kind: GroupKind, wf: usize, x: usize, y: usize, z: usize) -> BwResult<f32> {
        let (bx, xi) = self.locate(x, y, z)?;
        let idx = self.cell_index(kind.fields(), y, wf, z, xi);
        let slab = self.block(kind, bx).data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slab[idx])
    }

    /// Write one wavefield value at a global cell.
    pub fn set_field(
        &self,
        kind: GroupKind,
        wf: usize,
        x: usize,
        y: usize,
        z: usize,
        val: f32,
    ) -> BwResult<()> {
        let (bx, xi) = self.locate(x, y, z)?;
        let idx = self.cell_index(kind.fields(), y, wf, z, xi);
        let mut slab = self.block(kind, bx).data.lock().unwrap_or_else(|e| e.into_inner());
        slab[idx] = val;
        Ok(())
    }

    /// Write the four packed earth-model words of a cell.
    pub fn set_em_cell(&self, x: usize, y: usize, z: usize, words: [u32; 4]) -> BwResult<()> {
        for (wf, w) in words.iter().enumerate() {
            self.set_field(GroupKind::Em, wf, x, y, z, f32::from_bits(*w))?;
        }
        Ok(())
    }

    /// Read the four packed earth-model words of a cell.
    pub fn get_em_cell(&self, x: usize, y: usize, z: usize) -> BwResult<[u32; 4]> {
        let mut words = [0u32; 4];
        for (wf, w) in words.iter_mut().enumerate() {
            *w = self.get_field(GroupKind::Em, wf, x, y, z)?.to_bits();
        }
        Ok(words)
    }

    /// Replicate the earth model at `z0` upward to the top of the volume.
    pub fn em_extend_top(&self, z0: usize) -> BwResult<()> {
        if z0 == 0 {
            return Ok(());
        }
        let nx = self.nbx * self.bs_x;
        for x in 0..nx {
            for y in 0..self.ny {
                let words = self.get_em_cell(x, y, z0)?;
                for z in 0..z0 {
                    self.set_em_cell(x, y, z, words)?;
                }
            }
        }
        Ok(())
    }

    /// Replicate the earth model at `z1` downward to the bottom.
    pub fn em_extend_bottom(&self, z1: usize) -> BwResult<()> {
        if z1 + 1 >= self.nz {
            return Ok(());
        }
        let nx = self.nbx * self.bs_x;
        for x in 0..nx {
            for y in 0..self.ny {
                let words = self.get_em_cell(x, y, z1)?;
                for z in z1 + 1..self.nz {
                    self.set_em_cell(x, y, z, words)?;
                }
            }
        }
        Ok(())
    }

    /// Replicate the earth model outward past `x0` and `x1`.
    pub fn em_extend_sides_x(&self, x0: usize, x1: usize) -> BwResult<()> {
        let nx = self.nbx * self.bs_x;
        for y in 0..self.ny {
            for z in 0..self.nz {
                if x0 > 0 {
                    let words = self.get_em_cell(x0, y, z)?;
                    for x in 0..x0 {
                        self.set_em_cell(x, y, z, words)?;
                    }
                }
                if x1 + 1 < nx {
                    let words = self.get_em_cell(x1, y, z)?;
                    for x in x1 + 1..nx {
                        self.set_em_cell(x, y, z, words)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replicate the earth model outward past `y0` and `y1`.
    pub fn em_extend_sides_y(&self, y0: usize, y1: usize) -> BwResult<()> {
        let nx = self.nbx * self.bs_x;
        for x in 0..nx {
            for z in 0..self.nz {
                if y0 > 0 {
                    let words = self.get_em_cell(x, y0, z)?;
                    for y in 0..y0 {
                        self.set_em_cell(x, y, z, words)?;
                    }
                }
                if y1 + 1 < self.ny {
                    let words = self.get_em_cell(x, y1, z)?;
                    for y in y1 + 1..self.ny {
                        self.set_em_cell(x, y, z, words)?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pinned staging slots
// ---------------------------------------------------------------------------

/// A double-buffered staging slot pair.
///
/// For input pairs the devices read slot 0 while the CPU fills slot 1;
/// for output pairs the devices write slot 1 while the CPU drains slot
/// 0. [`SlotPair::swap`] rotates the roles once per block-cycle.
pub(crate) struct SlotPair {
    slots: [HostSlab; 2],
}

impl SlotPair {
    pub fn new(floats: usize) -> Self {
        SlotPair {
            slots: [
                Arc::new(Mutex::new(PageSlab::zeroed(floats))),
                Arc::new(Mutex::new(PageSlab::zeroed(floats))),
            ],
        }
    }

    pub fn swap(&mut self) {
        self.slots.swap(0, 1);
    }

    pub fn slot(&self, i: usize) -> &HostSlab {
        &self.slots[i]
    }
}

/// All six staging pairs (EM output only exists in debug sessions).
pub(crate) struct Staging {
    pub pv_in: SlotPair,
    pub st_in: SlotPair,
    pub em_in: SlotPair,
    pub pv_out: SlotPair,
    pub st_out: SlotPair,
    pub em_out: Option<SlotPair>,
}

impl Staging {
    pub fn allocate(host: &HostBlocks, debug_session: bool) -> Self {
        Staging {
            pv_in: SlotPair::new(host.pv_floats),
            st_in: SlotPair::new(host.st_floats),
            em_in: SlotPair::new(host.em_floats),
            pv_out: SlotPair::new(host.pv_floats),
            st_out: SlotPair::new(host.st_floats),
            em_out: debug_session.then(|| SlotPair::new(host.em_floats)),
        }
    }

    pub fn swap_all(&mut self) {
        self.pv_in.swap();
        self.st_in.swap();
        self.em_in.swap();
        self.pv_out.swap();
        self.st_out.swap();
        if let Some(em_out) = &mut self.em_out {
            em_out.swap();
        }
    }

    /// The slot devices read input from this cycle.
    pub fn device_in(&self, kind: GroupKind) -> &HostSlab {
        match kind {
            GroupKind::Pv => self.pv_in.slot(0),
            GroupKind::St => self.st_in.slot(0),
            GroupKind::Em => self.em_in.slot(0),
        }
    }

    /// The slot the CPU fills with the next input block.
    pub fn host_in(&self, kind: GroupKind) -> &HostSlab {
        match kind {
            GroupKind::Pv => self.pv_in.slot(1),
            GroupKind::St => self.st_in.slot(1),
            GroupKind::Em => self.em_in.slot(1),
        }
    }

    /// The slot devices write output into this cycle.
    pub fn device_out(&self, kind: GroupKind) -> Option<&HostSlab> {
        match kind {
            GroupKind::Pv => Some(self.pv_out.slot(1)),
            GroupKind::St => Some(self.st_out.slot(1)),
            GroupKind::Em => self.em_out.as_ref().map(|p| p.slot(1)),
        }
    }

    /// The slot the CPU drains the previous output block from.
    pub fn host_out(&self, kind: GroupKind) -> Option<&HostSlab> {
        match kind {
            GroupKind::Pv => Some(self.pv_out.slot(0)),
            GroupKind::St => Some(self.st_out.slot(0)),
            GroupKind::Em => self.em_out.as_ref().map(|p| p.slot(0)),
        }
    }
}

// ---------------------------------------------------------------------------
// Background pinning worker
// ---------------------------------------------------------------------------

/// Incrementally pins host blocks while device memory leaves room.
///
/// Runs until every block it can afford is pinned or the propagator
/// stops it at teardown. Pinning order is PV (most traffic), then ST,
/// then EM; a 50 MiB margin stays free on every device.
pub(crate) struct PinWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl PinWorker {
    pub fn start(host: &HostBlocks, runtime: Arc<DeviceRuntime>, device_ids: Vec<i32>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        // (flag, bytes) per block in pinning priority order.
        let mut queue: Vec<(Arc<AtomicBool>, u64)> = Vec::with_capacity(host.nbx * 3);
        for kind in [GroupKind::Pv, GroupKind::St, GroupKind::Em] {
            let bytes = (host.floats(kind) * 4) as u64;
            for bx in 0..host.nbx {
                queue.push((Arc::clone(&host.block(kind, bx).pinned), bytes));
            }
        }
        let total = queue.len();

        let handle = std::thread::Builder::new()
            .name("page-pinner".into())
            .spawn(move || {
                let mut pinned_bytes = 0u64;
                let mut pinned = 0usize;
                for (flag, bytes) in queue {
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let min_free = device_ids
                        .iter()
                        .map(|&d| runtime.free_bytes(d))
                        .min()
                        .unwrap_or(0);
                    if pinned_bytes + bytes + PIN_MARGIN > min_free {
                        break;
                    }
                    flag.store(true, Ordering::Release);
                    pinned_bytes += bytes;
                    pinned += 1;
                    // Registration is incremental; yield between blocks
                    // so the orchestrator keeps the cores.
                    std::thread::yield_now();
                }
                info!(pinned, total, pinned_bytes, "host block pinning done");
                pinned
            })
            .ok();

        PinWorker { stop, handle }
    }

    /// Stop and join; returns how many blocks ended up pinned.
    pub fn join(mut self) -> usize {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take().and_then(|h| h.join().ok()).unwrap_or(0)
    }
}

impl Drop for PinWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_slab_alignment_and_len() {
        let slab = PageSlab::zeroed(100);
        assert_eq!(slab.len(), 100);
        assert_eq!(slab.as_ptr() as usize % PAGE_BYTES, 0);
        assert!(slab.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_page_slab_first_touch_parallel() {
        let slab = PageSlab::first_touch(PAGE_FLOATS * 7 + 3, 4);
        assert!(slab.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_parallel_copy_matches_serial() {
        let src: Vec<f32> = (0..PAGE_FLOATS * 5 + 17).map(|i| i as f32).collect();
        let mut dst = vec![0.0f32; src.len()];
        parallel_copy(&mut dst, &src, 4);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_cell_layout_round_trip() {
        let host = HostBlocks::allocate(4, 3, 8, 8, 1);
        host.set_field(GroupKind::Pv, 2, 9, 5, 7, 42.0).unwrap();
        assert_eq!(host.get_field(GroupKind::Pv, 2, 9, 5, 7).unwrap(), 42.0);
        // Neighbouring cells untouched.
        assert_eq!(host.get_field(GroupKind::Pv, 2, 10, 5, 7).unwrap(), 0.0);
        assert_eq!(host.get_field(GroupKind::Pv, 1, 9, 5, 7).unwrap(), 0.0);
    }

    #[test]
    fn test_cell_bounds_checked() {
        let host = HostBlocks::allocate(4, 2, 4, 4, 1);
        assert!(host.get_field(GroupKind::St, 0, 8, 0, 0).is_err());
        assert!(host.get_field(GroupKind::St, 0, 0, 4, 0).is_err());
        assert!(host.set_field(GroupKind::St, 0, 0, 0, 4, 0.0).is_err());
    }

    #[test]
    fn test_em_cell_words_round_trip() {
        let host = HostBlocks::allocate(4, 2, 4, 4, 1);
        let words = [0xdeadbeef, 1, 2, 0xffffffff];
        host.set_em_cell(5, 2, 3, words).unwrap();
        assert_eq!(host.get_em_cell(5, 2, 3).unwrap(), words);
    }

    #[test]
    fn test_em_extend_top_and_bottom() {
        let host = HostBlocks::allocate(4, 1, 2, 8, 1);
        host.set_em_cell(1, 1, 3, [3, 3, 3, 3]).unwrap();
        host.set_em_cell(1, 1, 5, [5, 5, 5, 5]).unwrap();
        host.em_extend_top(3).unwrap();
        host.em_extend_bottom(5).unwrap();
        assert_eq!(host.get_em_cell(1, 1, 0).unwrap(), [3, 3, 3, 3]);
        assert_eq!(host.get_em_cell(1, 1, 2).unwrap(), [3, 3, 3, 3]);
        assert_eq!(host.get_em_cell(1, 1, 7).unwrap(), [5, 5, 5, 5]);
        // Interior untouched.
        assert_eq!(host.get_em_cell(1, 1, 4).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_em_extend_sides() {
        let host = HostBlocks::allocate(4, 2, 4, 2, 1);
        host.set_em_cell(2, 1, 0, [7, 0, 0, 0]).unwrap();
        host.set_em_cell(5, 1, 0, [9, 0, 0, 0]).unwrap();
        host.em_extend_sides_x(2, 5).unwrap();
        assert_eq!(host.get_em_cell(0, 1, 0).unwrap()[0], 7);
        assert_eq!(host.get_em_cell(7, 1, 0).unwrap()[0], 9);

        host.set_em_cell(0, 1, 1, [11, 0, 0, 0]).unwrap();
        host.set_em_cell(0, 2, 1, [13, 0, 0, 0]).unwrap();
        host.em_extend_sides_y(1, 2).unwrap();
        assert_eq!(host.get_em_cell(0, 0, 1).unwrap()[0], 11);
        assert_eq!(host.get_em_cell(0, 3, 1).unwrap()[0], 13);
    }

    #[test]
    fn test_slot_pair_swap() {
        let mut pair = SlotPair::new(8);
        pair.slot(0).lock().unwrap()[0] = 1.0;
        pair.slot(1).lock().unwrap()[0] = 2.0;
        pair.swap();
        assert_eq!(pair.slot(0).lock().unwrap()[0], 2.0);
        assert_eq!(pair.slot(1).lock().unwrap()[0], 1.0);
    }

    #[test]
    fn test_pin_worker_respects_budget() {
        let host = HostBlocks::allocate(4, 4, 8, 8, 1);
        // Capacity so small that nothing fits under the 50 MiB margin.
        let rt = DeviceRuntime::new(&[(0, 1 << 20)]).unwrap();
        let worker = PinWorker::start(&host, Arc::clone(&rt), vec![0]);
        assert_eq!(worker.join(), 0);
        assert!(!host.block(GroupKind::Pv, 0).pinned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_pin_worker_pins_in_priority_order() {
        let host = HostBlocks::allocate(4, 2, 4, 4, 1);
        // Budget for margin plus roughly three blocks.
        let block_bytes = (host.pv_floats * 4) as u64;
        let rt = DeviceRuntime::new(&[(0, PIN_MARGIN + 3 * block_bytes + 1024)]).unwrap();
        let worker = PinWorker::start(&host, Arc::clone(&rt), vec![0]);
        let pinned = worker.join();
        assert!(pinned >= 2, "pinned {}", pinned);
        // PV blocks pin before ST and EM.
        assert!(host.block(GroupKind::Pv, 0).pinned.load(Ordering::Relaxed));
        assert!(host.block(GroupKind::Pv, 1).pinned.load(Ordering::Relaxed));
        assert!(!host.block(GroupKind::Em, 1).pinned.load(Ordering::Relaxed));
    }
}
