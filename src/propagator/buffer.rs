//! Buffer records: the nodes of a pipeline's data-flow chain.
//!
//! Buffers live in a per-pipe arena and refer to each other by index —
//! no shared ownership. Each buffer owns a small ring of device slabs
//! addressed by absolute block index modulo the ring depth, so a value
//! written for block `b` stays in place until the ring wraps, however
//! many cycles later its consumers read it. A buffer's absolute block
//! index at iteration `t` is `t + cbo`; the per-cycle "shift" of the
//! whole chain is the iteration counter advancing.

use super::device::{DevBufId, DeviceId, Parity};
use super::host::GroupKind;

/// Index of a buffer within its pipe's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub usize);

/// What a buffer does each block-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Lands a host input block (H2D from staging or a pinned block).
    HostInput,
    /// Lands a peer transfer from the previous device in the chain.
    PeerInput,
    /// Produces one sub-step on its device.
    Compute,
    /// Read-only earth-model slab trailing its device.
    EarthModel,
}

/// One node of the pipeline chain.
#[derive(Debug)]
pub struct Buffer {
    pub device: DeviceId,
    pub role: BufferRole,
    pub kind: GroupKind,
    /// Timestep this buffer's data has reached (pipe-relative).
    pub timestep: i32,
    pub parity: Parity,
    /// Y-range the slab covers (inclusive).
    pub y0: i32,
    pub y1: i32,
    /// Z-range (inclusive; full volume depth in practice).
    pub z0: i32,
    pub z1: i32,
    /// Y-range this buffer actually computes; narrower than the slab
    /// for the two halves of a partial-step hand-off.
    pub cy0: i32,
    pub cy1: i32,
    /// Current-block offset: absolute block at iteration t is `t + cbo`.
    pub cbo: i32,
    /// Ring depth: how many X-blocks stay resident on the device.
    pub ring_len: usize,
    /// Device slabs, one per ring slot; filled by device allocation.
    pub ring: Vec<DevBufId>,
    /// Non-owning references to up to four prior buffers: same-parity
    /// state, other-parity state, earth model, peer partial source.
    pub srcs: [Option<BufferId>; 4],
    /// Drains into the pinned output staging area.
    pub to_host: bool,
}

impl Buffer {
    /// Slab width along Y.
    pub fn width_y(&self) -> usize {
        (self.y1 - self.y0 + 1) as usize
    }

    /// Slab depth along Z.
    pub fn depth_z(&self) -> usize {
        (self.z1 - self.z0 + 1) as usize
    }

    /// Floats in one Y-row of the slab (full Z sheet of one X-block).
    pub fn row_floats(&self, bs_x: usize) -> usize {
        bs_x * self.depth_z() * self.kind.fields()
    }

    /// Floats in one ring slot.
    pub fn slab_floats(&self, bs_x: usize) -> usize {
        self.width_y() * self.row_floats(bs_x)
    }

    /// Ring slot holding (or about to hold) the given absolute block.
    pub fn ring_slot(&self, block: i64) -> usize {
        block.rem_euclid(self.ring_len as i64) as usize
    }

    /// Device slab for the given absolute block.
    pub fn slab(&self, block: i64) -> DevBufId {
        self.ring[self.ring_slot(block)]
    }
}

/// The source slot layout used by kernel launches.
pub(crate) const SRC_SAME_PARITY: usize = 0;
pub(crate) const SRC_OTHER_PARITY: usize = 1;
pub(crate) const SRC_EARTH_MODEL: usize = 2;
pub(crate) const SRC_PEER_PARTIAL: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(cbo: i32, ring_len: usize) -> Buffer {
        Buffer {
            device: 0,
            role: BufferRole::Compute,
            kind: GroupKind::Pv,
            timestep: 1,
            parity: Parity::Velocity,
            y0: 4,
            y1: 11,
            z0: 0,
            z1: 15,
            cy0: 4,
            cy1: 11,
            cbo,
            ring_len,
            ring: Vec::new(),
            srcs: [None; 4],
            to_host: false,
        }
    }

    #[test]
    fn test_ring_slot_wraps_by_block() {
        let b = buffer(-3, 3);
        assert_eq!(b.ring_slot(0), 0);
        assert_eq!(b.ring_slot(1), 1);
        assert_eq!(b.ring_slot(3), 0);
        // A block stays in its slot for ring_len cycles.
        assert_eq!(b.ring_slot(7), b.ring_slot(7));
    }

    #[test]
    fn test_slab_geometry() {
        let b = buffer(0, 2);
        assert_eq!(b.width_y(), 8);
        assert_eq!(b.depth_z(), 16);
        assert_eq!(b.row_floats(4), 4 * 16 * 6);
        assert_eq!(b.slab_floats(4), 8 * 4 * 16 * 6);
    }
}
