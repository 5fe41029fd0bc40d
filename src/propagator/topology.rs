//! Pipeline topology: Y-slab partitioning and buffer-chain construction.
//!
//! A pipe owns a contiguous Y-slab and a chain of buffers ordered by
//! decreasing block offset. The chain is built by enumerating the
//! `gpus_per_pipe * steps_per_device * 2` logical sub-steps a block
//! traverses, walking them oldest-first while accumulating the cost
//! model, and closing a device's range each time the cumulative cost
//! crosses the per-device budget. Hand-offs instantiate the sending
//! compute buffer, the receiving-end buffer and the widened input-halo
//! buffer on the next device; when the budget boundary falls strictly
//! inside a sub-step, the step itself is split into a sending and a
//! receiving partial buffer pair. Earth-model buffers trail each device
//! with enough Y-range and ring depth to cover every sub-step executed
//! there, chained device to device.

use tracing::{info, warn};

use super::buffer::{
    Buffer, BufferId, BufferRole, SRC_EARTH_MODEL, SRC_OTHER_PARITY, SRC_PEER_PARTIAL,
    SRC_SAME_PARITY,
};
use super::device::{DeviceId, Parity};
use super::host::GroupKind;
use crate::{BwError, BwResult};

/// Tolerance for the cost-budget comparison: sums accumulated in
/// opposite orders can differ in the last bits.
const COST_EPS: f64 = 1e-6;

/// Inputs to topology construction.
#[derive(Debug, Clone)]
pub(crate) struct TopologyParams {
    pub ny: usize,
    pub nz: usize,
    pub num_pipes: usize,
    pub steps_per_device: usize,
    pub devices: Vec<DeviceId>,
    pub half_stencil: usize,
    pub rel_cost: [f64; 2],
    pub debug: bool,
}

/// One pipe: its Y-slab, devices and buffer arena in chain order.
pub(crate) struct PipeTopology {
    pub pipe_id: usize,
    pub y0: i32,
    pub y1: i32,
    pub z0: i32,
    pub z1: i32,
    pub buffers: Vec<Buffer>,
    /// Devices contributing to this pipe, in chain order.
    pub devices: Vec<DeviceId>,
    /// Timesteps a block advances per pass through this pipe.
    pub steps_per_sweep: i32,
}

impl PipeTopology {
    /// cbo of the newest output buffer (the most negative in the chain).
    pub fn output_cbo(&self) -> i32 {
        let n = self.buffers.len();
        self.buffers[n - 2].cbo.min(self.buffers[n - 3].cbo)
    }

    /// Absolute input block consumed at `iteration` (head cbo is 0).
    pub fn input_block(&self, iteration: i64) -> i64 {
        iteration
    }

    /// Absolute output block produced at `iteration`, once the pipe has
    /// filled.
    pub fn output_block(&self, iteration: i64) -> Option<i64> {
        let b = iteration + self.output_cbo() as i64;
        (b >= 0).then_some(b)
    }

    /// Total device memory one device needs for this pipe, in floats.
    pub fn device_memory_floats(&self, device: DeviceId, bs_x: usize) -> u64 {
        self.buffers
            .iter()
            .filter(|b| b.device == device)
            .map(|b| (b.ring_len * b.slab_floats(bs_x)) as u64)
            .sum()
    }

    /// Human-readable chain dump for logs.
    pub fn describe(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pipe {} y=[{}, {}] z=[{}, {}] devices={:?}",
            self.pipe_id, self.y0, self.y1, self.z0, self.z1, self.devices
        );
        for (i, b) in self.buffers.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{:2}] dev {} {:?} {:?} ts {} cbo {:3} ring {} y=[{}, {}] compute=[{}, {}]{}",
                i,
                b.device,
                b.role,
                b.kind,
                b.timestep,
                b.cbo,
                b.ring_len,
                b.y0,
                b.y1,
                b.cy0,
                b.cy1,
                if b.to_host { " ->host" } else { "" }
            );
        }
        out
    }
}

/// The cost model: one Y-slab of `ylen` rows walked backwards through
/// `2 * steps * gpus` sub-steps, widening by the half stencil each step
/// and saturating at the volume bounds. Used for the inter-pipe split
/// and for the tuner's viability prediction.
pub fn pipe_cost(
    y0: i32,
    ylen: i32,
    ny: i32,
    steps: usize,
    gpus: usize,
    h: i32,
    rel_cost: [f64; 2],
) -> f64 {
    let mut yy0 = y0;
    let mut yy1 = y0 + ylen - 1;
    let mut cost = 0.0;
    for _ in 0..gpus {
        for _ in 0..steps {
            // Sub-steps are walked newest-first here, so the parity
            // index is reversed.
            for i in 0..2 {
                cost += (yy1 - yy0 + 1) as f64 * rel_cost[1 - i];
                yy0 = (yy0 - h).max(0);
                yy1 = (yy1 + h).min(ny - 1);
            }
        }
    }
    cost
}

/// Partition ny into per-pipe widths. Edge pipes get extra rows to
/// compensate interior pipes' halo overhead; returns the equal split
/// (and a failure flag) when the volume is too narrow for that.
fn split_pipes(p: &TopologyParams) -> BwResult<(Vec<i32>, bool)> {
    let num_pipes = p.num_pipes;
    let ny = p.ny as i32;
    let gpus_per_pipe = p.devices.len() / num_pipes;
    let h = p.half_stencil as i32;

    let equal = |ny: i32| -> BwResult<Vec<i32>> {
        let k = (ny + num_pipes as i32 - 1) / num_pipes as i32;
        let mut widths = vec![k; num_pipes];
        widths[num_pipes - 1] -= k * num_pipes as i32 - ny;
        if widths[num_pipes - 1] < 1 {
            return Err(BwError::InvalidConfig(format!(
                "ny = {} cannot be split into {} pipes",
                ny, num_pipes
            )));
        }
        Ok(widths)
    };

    if num_pipes <= 2 {
        return Ok((equal(ny)?, false));
    }

    let n_sub = gpus_per_pipe * p.steps_per_device * 2;
    let mut half_halo_cost = 0.0;
    for i in 1..n_sub {
        half_halo_cost += (i as f64) * (h as f64) * p.rel_cost[i & 1];
    }
    let extra = half_halo_cost / (gpus_per_pipe * p.steps_per_device * num_pipes) as f64;
    let extra = 2.0 * extra / (p.rel_cost[0] + p.rel_cost[1]);

    let mut widths = Vec::with_capacity(num_pipes);
    let mut y0 = 0.0f64;
    for ip in 0..num_pipes {
        let adjust = if ip == 0 || ip == num_pipes - 1 {
            extra * (num_pipes - 2) as f64 / 2.0
        } else {
            -extra
        };
        let y1 = y0 + ny as f64 / num_pipes as f64 + adjust;
        widths.push(y1.round() as i32 - y0.round() as i32);
        y0 = y1;
    }

    let min_width = (2 * h).max(1);
    if widths.iter().any(|&w| w < min_width) {
        warn!(ny, num_pipes, "volume too narrow for balanced split, falling back to equal");
        return Ok((equal(ny)?, true));
    }

    // Report the balance the split achieved.
    let mut total = 0.0;
    let mut costs = Vec::with_capacity(num_pipes);
    let mut yy = 0;
    for &w in &widths {
        let c = pipe_cost(yy, w, ny, p.steps_per_device, gpus_per_pipe, h, p.rel_cost);
        costs.push(c);
        total += c;
        yy += w;
    }
    let mut yy = 0;
    for (ip, (&w, c)) in widths.iter().zip(&costs).enumerate() {
        info!(
            pipe = ip,
            y0 = yy,
            y1 = yy + w - 1,
            width = w,
            share = format!("{:.2}%", 100.0 * c / total),
            "pipe load balance"
        );
        yy += w;
    }

    Ok((widths, false))
}

/// Build all pipes. Returns the pipes and whether inter-pipe load
/// balancing had to fall back to an equal split.
pub(crate) fn build_pipes(p: &TopologyParams) -> BwResult<(Vec<PipeTopology>, bool)> {
    if p.num_pipes == 0 || p.devices.is_empty() {
        return Err(BwError::InvalidConfig("no pipes or devices".into()));
    }
    if p.devices.len() % p.num_pipes != 0 {
        return Err(BwError::InvalidConfig(format!(
            "{} devices cannot be divided over {} pipes",
            p.devices.len(),
            p.num_pipes
        )));
    }
    if p.steps_per_device == 0 {
        return Err(BwError::InvalidConfig("steps_per_device must be > 0".into()));
    }

    let gpus_per_pipe = p.devices.len() / p.num_pipes;
    let (widths, failed) = split_pipes(p)?;

    let mut pipes = Vec::with_capacity(p.num_pipes);
    let mut y0 = 0i32;
    for (ip, &w) in widths.iter().enumerate() {
        let devices = &p.devices[ip * gpus_per_pipe..(ip + 1) * gpus_per_pipe];
        pipes.push(build_pipe(p, ip, y0, y0 + w - 1, devices)?);
        y0 += w;
    }
    Ok((pipes, failed))
}

fn parity_of(istep: i32) -> Parity {
    if istep & 1 == 1 {
        Parity::Velocity
    } else {
        Parity::Stress
    }
}

fn group_of(parity: Parity) -> GroupKind {
    match parity {
        Parity::Stress => GroupKind::St,
        Parity::Velocity => GroupKind::Pv,
    }
}

struct ChainBuilder {
    arena: Vec<Buffer>,
    last_st: Option<BufferId>,
    last_pv: Option<BufferId>,
}

impl ChainBuilder {
    fn push(&mut self, buf: Buffer) -> BufferId {
        let id = BufferId(self.arena.len());
        self.arena.push(buf);
        id
    }

    fn last(&self, parity: Parity) -> Option<BufferId> {
        match parity {
            Parity::Stress => self.last_st,
            Parity::Velocity => self.last_pv,
        }
    }

    fn set_last(&mut self, parity: Parity, id: BufferId) {
        match parity {
            Parity::Stress => self.last_st = Some(id),
            Parity::Velocity => self.last_pv = Some(id),
        }
    }

    /// Point every compute buffer of `device` without an earth-model
    /// source at `em_id`.
    fn attach_em(&mut self, device: DeviceId, em_id: BufferId) {
        for buf in &mut self.arena {
            if buf.device == device
                && buf.role == BufferRole::Compute
                && buf.srcs[SRC_EARTH_MODEL].is_none()
            {
                buf.srcs[SRC_EARTH_MODEL] = Some(em_id);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_pipe(
    p: &TopologyParams,
    pipe_id: usize,
    pipe_y0: i32,
    pipe_y1: i32,
    devices: &[DeviceId],
) -> BwResult<PipeTopology> {
    let ny = p.ny as i32;
    let nz = p.nz as i32;
    let h = p.half_stencil as i32;
    let g = devices.len();
    let k = p.steps_per_device;
    let n_sub = g * k * 2;
    let (z0, z1) = (0, nz - 1);

    // Sub-step Y-ranges, oldest (widest) first. Walking backwards from
    // the pipe's own slab, each older sub-step needs `h` more rows on
    // each side, clamped to the volume.
    let mut steps = vec![(0i32, 0i32); n_sub];
    let mut total_cost = 0.0;
    {
        let (mut yy0, mut yy1) = (pipe_y0, pipe_y1);
        for i in (0..n_sub).rev() {
            steps[i] = (yy0, yy1);
            total_cost += (yy1 - yy0 + 1) as f64 * p.rel_cost[i & 1];
            yy0 = (yy0 - h).max(0);
            yy1 = (yy1 + h).min(ny - 1);
        }
    }
    let max_cost_per_gpu = total_cost / g as f64;

    let widen = |y0: i32, y1: i32| ((y0 - h).max(0), (y1 + h).min(ny - 1));

    let mut cb = ChainBuilder {
        arena: Vec::new(),
        last_st: None,
        last_pv: None,
    };

    let mut igpu = 0usize;
    let mut device = devices[0];
    let mut cost = 0.0f64;
    let mut cbo = 0i32;
    let mut emcbo;
    let mut curr_steps = 0usize;
    let mut min_y = i32::MAX;
    let mut max_y = i32::MIN;
    let mut prev_em: Option<BufferId> = None;
    let mut istep = 0i32;

    // Head: the two host-input buffers. The second (consumed one
    // sub-step later) carries one extra halo and a deeper ring.
    {
        let (vy0, vy1) = steps[0];
        let b1 = cb.push(Buffer {
            device,
            role: BufferRole::HostInput,
            kind: group_of(parity_of(istep)),
            timestep: istep / 2,
            parity: parity_of(istep),
            y0: vy0,
            y1: vy1,
            z0,
            z1,
            cy0: vy0,
            cy1: vy1,
            cbo: 0,
            ring_len: 3,
            ring: Vec::new(),
            srcs: [None; 4],
            to_host: false,
        });
        cb.set_last(parity_of(istep), b1);

        let (iy0, iy1) = widen(vy0, vy1);
        let b2 = cb.push(Buffer {
            device,
            role: BufferRole::HostInput,
            kind: group_of(parity_of(istep + 1)),
            timestep: (istep + 1) / 2,
            parity: parity_of(istep + 1),
            y0: iy0,
            y1: iy1,
            z0,
            z1,
            cy0: iy0,
            cy1: iy1,
            cbo: 0,
            ring_len: 4,
            ring: Vec::new(),
            srcs: [None; 4],
            to_host: false,
        });
        cb.set_last(parity_of(istep + 1), b2);
        emcbo = cbo;
        cbo -= 2;
    }

    for (i, &(vy0, vy1)) in steps.iter().enumerate() {
        let ylen = (vy1 - vy0 + 1) as f64;
        let local_cost = ylen * p.rel_cost[i & 1];
        let compute_parity = parity_of(istep + 2);

        if cost + local_cost >= max_cost_per_gpu - COST_EPS {
            // Hand-off. Decide between a mid-step split and a boundary
            // split; degenerate splits collapse to the boundary case.
            let mut split = ((max_cost_per_gpu - cost) / local_cost * ylen).round() as i32;
            if cost + local_cost <= max_cost_per_gpu + COST_EPS {
                split = ylen as i32;
            }
            let partial = split > 0 && split < ylen as i32;

            let old_last_st = cb.last_st;
            let old_last_pv = cb.last_pv;

            if partial {
                // Sending half of the split sub-step.
                let split_cost = local_cost * split as f64 / ylen;
                cost += split_cost;
                let send = cb.push(Buffer {
                    device,
                    role: BufferRole::Compute,
                    kind: group_of(compute_parity),
                    timestep: (istep + 2) / 2,
                    parity: compute_parity,
                    y0: vy0,
                    y1: vy0 + split - 1,
                    z0,
                    z1,
                    cy0: vy0,
                    cy1: vy0 + split - 1,
                    cbo,
                    ring_len: 2,
                    ring: Vec::new(),
                    srcs: [cb.last(compute_parity), cb.last(other(compute_parity)), None, None],
                    to_host: false,
                });
                cb.set_last(compute_parity, send);
                cbo -= 1;
                curr_steps += 1;
                min_y = min_y.min(vy0);
                max_y = max_y.max(vy0 + split - 1);

                let em = cb.push(Buffer {
                    device,
                    role: BufferRole::EarthModel,
                    kind: GroupKind::Em,
                    timestep: 0,
                    parity: Parity::Stress,
                    y0: min_y,
                    y1: max_y,
                    z0,
                    z1,
                    cy0: min_y,
                    cy1: max_y,
                    cbo: emcbo,
                    ring_len: curr_steps + 2,
                    ring: Vec::new(),
                    srcs: [prev_em, None, None, None],
                    to_host: false,
                });
                cb.attach_em(device, em);
                prev_em = Some(em);
                curr_steps = 0;
                min_y = i32::MAX;
                max_y = i32::MIN;

                igpu += 1;
                if igpu >= g {
                    break;
                }
                cost = local_cost - split_cost;
                device = devices[igpu];

                // Receiving end: the tail of the pre-update same-parity
                // state, plus the widened other-parity input halo.
                let recv = cb.push(Buffer {
                    device,
                    role: BufferRole::PeerInput,
                    kind: group_of(parity_of(istep)),
                    timestep: istep / 2,
                    parity: parity_of(istep),
                    y0: vy0 + split,
                    y1: vy1,
                    z0,
                    z1,
                    cy0: vy0 + split,
                    cy1: vy1,
                    cbo: cbo + 1,
                    ring_len: 3,
                    ring: Vec::new(),
                    srcs: [old_last(old_last_st, old_last_pv, parity_of(istep)), None, None, None],
                    to_host: false,
                });
                let (iy0, iy1) = widen(vy0, vy1);
                let halo = cb.push(Buffer {
                    device,
                    role: BufferRole::PeerInput,
                    kind: group_of(parity_of(istep + 1)),
                    timestep: (istep + 1) / 2,
                    parity: parity_of(istep + 1),
                    y0: iy0,
                    y1: iy1,
                    z0,
                    z1,
                    cy0: iy0,
                    cy1: iy1,
                    cbo: cbo + 1,
                    ring_len: 4,
                    ring: Vec::new(),
                    srcs: [
                        old_last(old_last_st, old_last_pv, parity_of(istep + 1)),
                        None,
                        None,
                        None,
                    ],
                    to_host: false,
                });

                // Receiving half: full slab, computes only the tail.
                let mut srcs = [None; 4];
                srcs[SRC_SAME_PARITY] = Some(recv);
                srcs[SRC_OTHER_PARITY] = Some(halo);
                srcs[SRC_PEER_PARTIAL] = Some(send);
                let rp = cb.push(Buffer {
                    device,
                    role: BufferRole::Compute,
                    kind: group_of(compute_parity),
                    timestep: (istep + 2) / 2,
                    parity: compute_parity,
                    y0: vy0,
                    y1: vy1,
                    z0,
                    z1,
                    cy0: vy0 + split,
                    cy1: vy1,
                    cbo,
                    ring_len: 4,
                    ring: Vec::new(),
                    srcs,
                    to_host: false,
                });
                cb.set_last(parity_of(istep), recv);
                cb.set_last(parity_of(istep + 1), halo);
                cb.set_last(compute_parity, rp);
                emcbo = cbo + 1;
                cbo -= 2;
                curr_steps += 1;
                min_y = min_y.min(vy0);
                max_y = max_y.max(vy1);
            } else {
                // Boundary split: full sending step, then the receive
                // and input-halo pair on the next device.
                let send = cb.push(Buffer {
                    device,
                    role: BufferRole::Compute,
                    kind: group_of(compute_parity),
                    timestep: (istep + 2) / 2,
                    parity: compute_parity,
                    y0: vy0,
                    y1: vy1,
                    z0,
                    z1,
                    cy0: vy0,
                    cy1: vy1,
                    cbo,
                    ring_len: 2,
                    ring: Vec::new(),
                    srcs: [cb.last(compute_parity), cb.last(other(compute_parity)), None, None],
                    to_host: false,
                });
                cb.set_last(compute_parity, send);
                cbo -= 1;
                curr_steps += 1;
                min_y = min_y.min(vy0);
                max_y = max_y.max(vy1);

                let em = cb.push(Buffer {
                    device,
                    role: BufferRole::EarthModel,
                    kind: GroupKind::Em,
                    timestep: 0,
                    parity: Parity::Stress,
                    y0: min_y,
                    y1: max_y,
                    z0,
                    z1,
                    cy0: min_y,
                    cy1: max_y,
                    cbo: emcbo,
                    ring_len: curr_steps + 3,
                    ring: Vec::new(),
                    srcs: [prev_em, None, None, None],
                    to_host: false,
                });
                cb.attach_em(device, em);
                prev_em = Some(em);
                emcbo = cbo;
                curr_steps = 0;
                min_y = i32::MAX;
                max_y = i32::MIN;

                igpu += 1;
                if igpu >= g {
                    break;
                }
                cost = cost + local_cost - max_cost_per_gpu;
                device = devices[igpu];

                let recv_parity = parity_of(istep + 1);
                let recv = cb.push(Buffer {
                    device,
                    role: BufferRole::PeerInput,
                    kind: group_of(recv_parity),
                    timestep: (istep + 1) / 2,
                    parity: recv_parity,
                    y0: vy0,
                    y1: vy1,
                    z0,
                    z1,
                    cy0: vy0,
                    cy1: vy1,
                    cbo,
                    ring_len: 3,
                    ring: Vec::new(),
                    srcs: [old_last(old_last_st, old_last_pv, recv_parity), None, None, None],
                    to_host: false,
                });
                // The halo carries the state the sending step just
                // produced, so it draws from that buffer.
                let halo_parity = parity_of(istep + 2);
                let (iy0, iy1) = widen(vy0, vy1);
                let halo = cb.push(Buffer {
                    device,
                    role: BufferRole::PeerInput,
                    kind: group_of(halo_parity),
                    timestep: (istep + 2) / 2,
                    parity: halo_parity,
                    y0: iy0,
                    y1: iy1,
                    z0,
                    z1,
                    cy0: iy0,
                    cy1: iy1,
                    cbo,
                    ring_len: 4,
                    ring: Vec::new(),
                    srcs: [Some(send), None, None, None],
                    to_host: false,
                });
                cb.set_last(recv_parity, recv);
                cb.set_last(halo_parity, halo);
                cbo -= 2;
            }
        } else {
            // Interior sub-step on the current device.
            cost += local_cost;
            let buf = cb.push(Buffer {
                device,
                role: BufferRole::Compute,
                kind: group_of(compute_parity),
                timestep: (istep + 2) / 2,
                parity: compute_parity,
                y0: vy0,
                y1: vy1,
                z0,
                z1,
                cy0: vy0,
                cy1: vy1,
                cbo,
                ring_len: 3,
                ring: Vec::new(),
                srcs: [cb.last(compute_parity), cb.last(other(compute_parity)), None, None],
                to_host: false,
            });
            cb.set_last(compute_parity, buf);
            cbo -= 1;
            curr_steps += 1;
            min_y = min_y.min(vy0);
            max_y = max_y.max(vy1);
        }
        istep += 1;
    }

    // Rounding can leave the last device without its hand-off; close
    // out its earth-model buffer here.
    if curr_steps > 0 {
        let em = cb.push(Buffer {
            device,
            role: BufferRole::EarthModel,
            kind: GroupKind::Em,
            timestep: 0,
            parity: Parity::Stress,
            y0: min_y,
            y1: max_y,
            z0,
            z1,
            cy0: min_y,
            cy1: max_y,
            cbo: emcbo,
            ring_len: curr_steps + 3,
            ring: Vec::new(),
            srcs: [prev_em, None, None, None],
            to_host: false,
        });
        cb.attach_em(device, em);
    }

    // Output stages: final stress, final velocity, and in debug the
    // trailing earth model.
    let n = cb.arena.len();
    if n < 3 {
        return Err(BwError::InvalidConfig("pipeline chain too short".into()));
    }
    cb.arena[n - 3].to_host = true;
    cb.arena[n - 2].to_host = true;
    if p.debug {
        cb.arena[n - 1].to_host = true;
    }

    let mut chain_devices = Vec::new();
    for buf in &cb.arena {
        if !chain_devices.contains(&buf.device) {
            chain_devices.push(buf.device);
        }
    }

    Ok(PipeTopology {
        pipe_id,
        y0: pipe_y0,
        y1: pipe_y1,
        z0,
        z1,
        buffers: cb.arena,
        devices: chain_devices,
        steps_per_sweep: (k * g) as i32,
    })
}

fn other(parity: Parity) -> Parity {
    match parity {
        Parity::Stress => Parity::Velocity,
        Parity::Velocity => Parity::Stress,
    }
}

fn old_last(
    last_st: Option<BufferId>,
    last_pv: Option<BufferId>,
    parity: Parity,
) -> Option<BufferId> {
    match parity {
        Parity::Stress => last_st,
        Parity::Velocity => last_pv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ny: usize, num_pipes: usize, steps: usize, ndev: usize) -> TopologyParams {
        TopologyParams {
            ny,
            nz: 64,
            num_pipes,
            steps_per_device: steps,
            devices: (0..ndev as i32).collect(),
            half_stencil: 4,
            rel_cost: [0.5, 0.5],
            debug: false,
        }
    }

    #[test]
    fn test_single_pipe_single_device_chain() {
        let (pipes, failed) = build_pipes(&params(128, 1, 3, 1)).unwrap();
        assert!(!failed);
        assert_eq!(pipes.len(), 1);
        let pipe = &pipes[0];
        assert_eq!(pipe.steps_per_sweep, 3);

        // Two head inputs + 2k computes + one earth-model buffer.
        assert_eq!(pipe.buffers.len(), 2 + 6 + 1);
        let computes: Vec<&Buffer> = pipe
            .buffers
            .iter()
            .filter(|b| b.role == BufferRole::Compute)
            .collect();
        assert_eq!(computes.len(), 6);
        // cbo decrements along the compute chain starting at -2.
        for (i, c) in computes.iter().enumerate() {
            assert_eq!(c.cbo, -2 - i as i32);
        }
        // Parities alternate starting with the stress half-step.
        assert_eq!(computes[0].parity, Parity::Stress);
        assert_eq!(computes[1].parity, Parity::Velocity);
        // Output marks: final stress, final velocity; EM not staged
        // outside debug.
        let n = pipe.buffers.len();
        assert!(pipe.buffers[n - 3].to_host);
        assert!(pipe.buffers[n - 2].to_host);
        assert!(!pipe.buffers[n - 1].to_host);
        assert_eq!(pipe.buffers[n - 1].role, BufferRole::EarthModel);
        assert_eq!(pipe.output_cbo(), -7);
    }

    #[test]
    fn test_sub_step_ranges_widen_backwards() {
        let (pipes, _) = build_pipes(&params(128, 1, 3, 1)).unwrap();
        let computes: Vec<&Buffer> = pipes[0]
            .buffers
            .iter()
            .filter(|b| b.role == BufferRole::Compute)
            .collect();
        // Oldest sub-steps carry the widest halo; ranges shrink toward
        // the pipe's own slab.
        for pair in computes.windows(2) {
            assert!(pair[0].y0 <= pair[1].y0);
            assert!(pair[0].y1 >= pair[1].y1);
        }
        let last = computes.last().unwrap();
        assert_eq!((last.y0, last.y1), (0, 127));
    }

    #[test]
    fn test_two_device_pipe_hands_off() {
        let (pipes, _) = build_pipes(&params(128, 1, 3, 2)).unwrap();
        let pipe = &pipes[0];
        assert_eq!(pipe.devices, vec![0, 1]);
        assert_eq!(pipe.steps_per_sweep, 6);

        // The chain crosses the device boundary with peer inputs.
        let peer_inputs: Vec<&Buffer> = pipe
            .buffers
            .iter()
            .filter(|b| b.role == BufferRole::PeerInput)
            .collect();
        assert!(!peer_inputs.is_empty());
        for b in peer_inputs {
            assert_eq!(b.device, 1);
            assert!(b.srcs[0].is_some());
            // Peer sources live on the other device.
            assert_eq!(pipe.buffers[b.srcs[0].unwrap().0].device, 0);
        }

        // Every device got exactly one earth-model buffer.
        let em_idx: Vec<usize> = pipe
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.role == BufferRole::EarthModel)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(em_idx.len(), 2);
        assert_eq!(pipe.buffers[em_idx[0]].device, 0);
        assert_eq!(pipe.buffers[em_idx[1]].device, 1);
        // EM buffers chain for the device-to-device trail.
        assert_eq!(pipe.buffers[em_idx[1]].srcs[0], Some(BufferId(em_idx[0])));

        // With equal rel_cost the boundary falls between sub-steps, so
        // all 12 sub-steps appear as computes (no partial split pair).
        let computes = pipe
            .buffers
            .iter()
            .filter(|b| b.role == BufferRole::Compute)
            .count();
        assert_eq!(computes, 12);
    }

    #[test]
    fn test_chain_cbo_non_increasing() {
        for ndev in [1, 2, 4] {
            let (pipes, _) = build_pipes(&params(256, 1, 4, ndev)).unwrap();
            for pipe in &pipes {
                let mut prev = i32::MAX;
                for b in &pipe.buffers {
                    if b.role != BufferRole::EarthModel {
                        assert!(b.cbo <= prev, "cbo increased along chain");
                        prev = b.cbo;
                    }
                }
            }
        }
    }

    #[test]
    fn test_compute_sources_resolve() {
        let (pipes, _) = build_pipes(&params(192, 1, 3, 2)).unwrap();
        for pipe in &pipes {
            for (i, b) in pipe.buffers.iter().enumerate() {
                if b.role == BufferRole::Compute {
                    let same = b.srcs[SRC_SAME_PARITY].expect("same-parity source");
                    let em = b.srcs[SRC_EARTH_MODEL].expect("earth-model source");
                    assert_eq!(pipe.buffers[same.0].parity, b.parity);
                    assert_eq!(pipe.buffers[em.0].role, BufferRole::EarthModel);
                    assert_eq!(pipe.buffers[em.0].device, b.device);
                    // Sources precede their consumers in the chain.
                    assert!(same.0 < i);
                }
            }
        }
    }

    #[test]
    fn test_pipe_widths_cover_volume() {
        for (ny, np, ndev) in [(256, 2, 2), (384, 4, 4), (512, 4, 8)] {
            let (pipes, _) = build_pipes(&params(ny, np, 3, ndev)).unwrap();
            assert_eq!(pipes.len(), np);
            let mut y = 0;
            for pipe in &pipes {
                assert_eq!(pipe.y0, y);
                y = pipe.y1 + 1;
            }
            assert_eq!(y as usize, ny);
        }
    }

    #[test]
    fn test_edge_pipes_get_extra_rows() {
        let (pipes, failed) = build_pipes(&params(512, 4, 3, 4)).unwrap();
        assert!(!failed);
        let w: Vec<i32> = pipes.iter().map(|p| p.y1 - p.y0 + 1).collect();
        assert!(w[0] > w[1], "edge pipe {} <= interior {}", w[0], w[1]);
        assert!(w[3] > w[2]);
    }

    #[test]
    fn test_narrow_volume_falls_back_to_equal_split() {
        // ny so small the balanced split would starve a pipe.
        let (pipes, failed) = build_pipes(&params(34, 4, 3, 4)).unwrap();
        assert!(failed);
        let w: Vec<i32> = pipes.iter().map(|p| p.y1 - p.y0 + 1).collect();
        assert_eq!(w.iter().sum::<i32>(), 34);
        assert_eq!(w[0], 9);
    }

    #[test]
    fn test_device_count_must_divide() {
        assert!(build_pipes(&params(128, 2, 3, 3)).is_err());
    }

    #[test]
    fn test_cost_function_widens_and_saturates() {
        // A slab at the volume edge saturates and costs less than an
        // interior slab of the same width.
        let edge = pipe_cost(0, 64, 512, 3, 2, 4, [0.5, 0.5]);
        let interior = pipe_cost(224, 64, 512, 3, 2, 4, [0.5, 0.5]);
        assert!(edge < interior);
        // Cost grows with steps and devices.
        assert!(pipe_cost(0, 64, 512, 4, 2, 4, [0.5, 0.5]) > edge);
    }

    #[test]
    fn test_memory_requirement_positive_and_split() {
        let (pipes, _) = build_pipes(&params(128, 1, 3, 2)).unwrap();
        let m0 = pipes[0].device_memory_floats(0, 4);
        let m1 = pipes[0].device_memory_floats(1, 4);
        assert!(m0 > 0 && m1 > 0);
        let total: u64 = pipes[0]
            .buffers
            .iter()
            .map(|b| (b.ring_len * b.slab_floats(4)) as u64)
            .sum();
        assert_eq!(m0 + m1, total);
    }

    #[test]
    fn test_describe_lists_every_buffer() {
        let (pipes, _) = build_pipes(&params(128, 1, 3, 1)).unwrap();
        let dump = pipes[0].describe();
        assert_eq!(dump.lines().count(), pipes[0].buffers.len() + 1);
        assert!(dump.contains("->host"));
    }
}
