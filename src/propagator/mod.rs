//! Pipelined multi-device sweep scheduler.
//!
//! The volume streams through the device pipelines one X-block per
//! block-cycle. Each cycle shifts every pipe by one block, swaps the
//! pinned staging slots, launches compute and transfer work on every
//! device, services the receiver path, overlaps the CPU-side staging
//! copies with the device work and finally synchronises all streams.
//!
//! **Ordering guarantees.** Commands on a device execute in launch
//! order; a compute for block *b* is launched after the input transfer
//! that feeds it landed (previous cycle, sealed by the end-of-cycle
//! synchronize). Peer transfers additionally wait on the source
//! device's compute event. A pinned output slot is recycled only after
//! the following cycle's device-to-host completed. Receiver extraction
//! runs after its device's compute; de-multiplexing happens on the CPU
//! one cycle after the extraction's device-to-host.
//!
//! With `slow_data_transfers` set, input transfer launches precede the
//! compute launches; output transfers always follow compute so an
//! output block is never drained before it exists.

pub mod buffer;
pub mod device;
pub mod host;
mod topology;
pub mod tuner;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::{BwError, BwResult};
use buffer::{Buffer, BufferRole, SRC_EARTH_MODEL, SRC_OTHER_PARITY, SRC_PEER_PARTIAL, SRC_SAME_PARITY};
use device::{
    DevBufId, DeviceId, DeviceRuntime, Event, HostSlab, KernelArgs, Parity, ReceiverSample,
    StreamKind, SubstepKernel,
};
use host::{GroupKind, HostBlocks, PinWorker, SlotPair, Staging};
use topology::{PipeTopology, TopologyParams};

pub use topology::pipe_cost;
pub use tuner::{auto_tune, TuneCandidate, TuneReport, ZTileTuner};

/// Safety factor applied to the stability limit.
const COURANT_SAFE: f64 = 0.95;

/// 8th-order staggered-grid first-derivative coefficients.
const C0: f64 = 1225.0 / 1024.0;
const C1: f64 = -245.0 / 3072.0;
const C2: f64 = 49.0 / 5120.0;
const C3: f64 = -5.0 / 7168.0;

/// Source wavelet samples and their sampling interval.
#[derive(Debug, Clone)]
pub struct SourceWavelet {
    pub samples: Vec<f32>,
    pub dt: f64,
}

/// One receiver: a cell, the wavefield sampled there, and the output
/// file it belongs to.
#[derive(Debug, Clone)]
pub struct ReceiverLocation {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    /// PV wavefield index (0 = Vx, 1 = Vy, 2 = Vz).
    pub field: usize,
    /// Output file the trace is demultiplexed into.
    pub file: usize,
}

/// One shot to propagate.
#[derive(Debug, Clone)]
pub struct Shot {
    pub id: u32,
    pub propagation_time: f64,
    pub receivers: Vec<ReceiverLocation>,
}

/// Scheduler configuration, as derived from the modelling job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
    /// Spatial stencil order; 8 is the supported value (bsX = 4).
    pub stencil_order: usize,
    pub num_pipes: usize,
    pub steps_per_device: usize,
    pub device_ids: Vec<DeviceId>,
    pub courant_factor: f64,
    /// Maximum propagation velocity of the model (for the time step).
    pub max_velocity: f64,
    pub source: SourceWavelet,
    pub free_surface: bool,
    pub source_ghost: bool,
    pub receiver_ghost: bool,
    pub debug: bool,
    /// Launch input transfers before compute (PCIe-starved hosts).
    pub slow_data_transfers: bool,
    /// Run the background worker that incrementally pins host blocks.
    pub pin_host_memory: bool,
}

impl JobConfig {
    fn validate(&self) -> BwResult<()> {
        for (axis, n) in [('x', self.nx), ('y', self.ny), ('z', self.nz)] {
            if n == 0 {
                return Err(BwError::InvalidVolumeDims { axis, size: n });
            }
        }
        if self.stencil_order != 8 {
            return Err(BwError::InvalidConfig(format!(
                "unsupported stencil order {} (only 8)",
                self.stencil_order
            )));
        }
        if self.device_ids.is_empty() {
            return Err(BwError::InvalidConfig("empty device list".into()));
        }
        if self.num_pipes == 0 || self.device_ids.len() % self.num_pipes != 0 {
            return Err(BwError::InvalidConfig(format!(
                "{} devices cannot serve {} pipes",
                self.device_ids.len(),
                self.num_pipes
            )));
        }
        if self.steps_per_device == 0 {
            return Err(BwError::InvalidConfig("steps_per_device must be > 0".into()));
        }
        if self.ny < self.num_pipes {
            return Err(BwError::InvalidConfig(format!(
                "ny = {} smaller than {} pipes",
                self.ny, self.num_pipes
            )));
        }
        if !(self.courant_factor > 0.0) || !(self.max_velocity > 0.0) {
            return Err(BwError::InvalidConfig(
                "courant_factor and max_velocity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Block width along X implied by the stencil order.
    pub fn block_size_x(&self) -> usize {
        self.stencil_order / 2
    }

    /// Number of X-blocks.
    pub fn num_blocks(&self) -> usize {
        self.nx.div_ceil(self.block_size_x())
    }
}

/// The kernels the scheduler launches; implementations are external.
#[derive(Clone)]
pub struct KernelSet {
    /// Stress (T) half-update.
    pub stress: Arc<dyn SubstepKernel>,
    /// Particle-velocity (V) half-update.
    pub velocity: Arc<dyn SubstepKernel>,
    /// Receiver extraction.
    pub extract: Arc<dyn SubstepKernel>,
}

/// Per-shot propagation state and results. Frees its device-side
/// receiver buffers on drop.
pub struct ShotState {
    pub num_timesteps: i32,
    pub dti: f64,
    /// One trace per receiver, one sample per completed pass.
    pub traces: Vec<Vec<f32>>,
    runtime: Arc<DeviceRuntime>,
    /// Per-pipe device-side receiver buffers.
    dev_bufs: Vec<DevBufId>,
    /// Per-pipe double-buffered host staging for extracted values.
    host_pairs: Vec<SlotPair>,
    /// Per pipe and block: the samples to extract and their receivers.
    samples: Vec<Vec<Arc<Vec<ReceiverSample>>>>,
    receiver_order: Vec<Vec<Vec<usize>>>,
    /// Block extracted this cycle (demuxed next cycle), per pipe.
    extracted_this: Vec<Option<usize>>,
    /// Block whose values sit in the host slot now, per pipe.
    extracted_prev: Vec<Option<usize>>,
}

impl Drop for ShotState {
    fn drop(&mut self) {
        for buf in self.dev_bufs.drain(..) {
            self.runtime.free(buf);
        }
    }
}

/// The pipelined propagator.
pub struct Propagator {
    cfg: JobConfig,
    runtime: Arc<DeviceRuntime>,
    kernels: KernelSet,
    pipes: Vec<PipeTopology>,
    host: HostBlocks,
    staging: Staging,
    rel_cost: [f64; 2],
    pin_worker: Option<PinWorker>,
    tried_p2p: HashMap<(DeviceId, DeviceId), bool>,
    load_balance_failed: bool,
    device_memory_allocated: bool,

    iteration: i64,
    first_call: bool,
    sweep_started: Instant,
    completed_timesteps: i64,
    z_tiles: usize,
    z_tile_tuner: Option<ZTileTuner>,
    dti: f64,
    /// Whether this cycle's outputs went through staging (recorded at
    /// launch; the drain one cycle later must use the same decision
    /// even if the pinning worker flips the flag in between).
    out_staged_this: OutStaged,
    out_staged_prev: OutStaged,
}

#[derive(Debug, Clone, Copy)]
struct OutStaged {
    pv: bool,
    st: bool,
    em: bool,
}

impl Default for OutStaged {
    fn default() -> Self {
        OutStaged {
            pv: true,
            st: true,
            em: true,
        }
    }
}

impl Propagator {
    /// Build the pipeline topology and allocate host memory. Device
    /// memory is allocated separately so the tuner can probe
    /// configurations cheaply.
    pub fn new(
        cfg: JobConfig,
        runtime: Arc<DeviceRuntime>,
        kernels: KernelSet,
    ) -> BwResult<Self> {
        cfg.validate()?;
        let rel_cost = [0.5, 0.5];

        let params = TopologyParams {
            ny: cfg.ny,
            nz: cfg.nz,
            num_pipes: cfg.num_pipes,
            steps_per_device: cfg.steps_per_device,
            devices: cfg.device_ids.clone(),
            half_stencil: cfg.stencil_order / 2,
            rel_cost,
            debug: cfg.debug,
        };
        let (pipes, load_balance_failed) = topology::build_pipes(&params)?;
        for pipe in &pipes {
            debug!("{}", pipe.describe());
        }

        let threads = crate::resolve_thread_count(0);
        let host = HostBlocks::allocate(
            cfg.block_size_x(),
            cfg.num_blocks(),
            cfg.ny,
            cfg.nz,
            threads,
        );
        let staging = Staging::allocate(&host, cfg.debug);

        Ok(Propagator {
            cfg,
            runtime,
            kernels,
            pipes,
            host,
            staging,
            rel_cost,
            pin_worker: None,
            tried_p2p: HashMap::new(),
            load_balance_failed,
            device_memory_allocated: false,
            iteration: 0,
            first_call: true,
            sweep_started: Instant::now(),
            completed_timesteps: 0,
            z_tiles: 1,
            z_tile_tuner: None,
            dti: 0.0,
            out_staged_this: OutStaged::default(),
            out_staged_prev: OutStaged::default(),
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.cfg
    }

    /// Host block arena (earth-model loading, source injection, debug).
    pub fn host_blocks(&self) -> &HostBlocks {
        &self.host
    }

    /// Whether inter-pipe load balancing fell back to an equal split.
    pub fn load_balance_failed(&self) -> bool {
        self.load_balance_failed
    }

    /// Timesteps a block advances per full pass.
    pub fn steps_per_sweep(&self) -> i32 {
        self.pipes[0].steps_per_sweep
    }

    /// Relative sub-step cost model (T kernel, V kernel).
    pub fn relative_cost(&self, parity: Parity) -> f64 {
        match parity {
            Parity::Stress => self.rel_cost[0],
            Parity::Velocity => self.rel_cost[1],
        }
    }

    /// Workload of a perfectly balanced pipe, in cost-model units.
    pub fn minimum_workload(&self) -> f64 {
        let ylen = self.cfg.ny as f64;
        self.steps_per_sweep() as f64 * (self.rel_cost[0] + self.rel_cost[1]) * ylen
            / self.cfg.num_pipes as f64
    }

    /// Set the internal Z-tile count (block-cycle granularity only).
    pub fn set_z_tiles(&mut self, z_tiles: usize) {
        self.z_tiles = z_tiles.max(1);
    }

    /// Install online Z-tile refinement over the given candidates.
    pub fn refine_z_tiles(&mut self, candidates: &[usize]) {
        let tuner = ZTileTuner::new(candidates);
        self.z_tiles = tuner.current();
        self.z_tile_tuner = Some(tuner);
    }

    /// Probe and enable peer access for a device pair once.
    fn enable_peer_access(&mut self, device: DeviceId, peer: DeviceId) {
        if device == peer {
            return;
        }
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.tried_p2p.entry((device, peer))
        {
            e.insert(true);
            debug!(device, peer, "peer access enabled");
        }
    }

    /// Allocate every buffer's device ring. Failure frees what was
    /// allocated and surfaces the Resource error (the tuner skips the
    /// configuration; a live run treats it as fatal).
    pub fn allocate_device_memory(&mut self) -> BwResult<()> {
        let bs_x = self.cfg.block_size_x();
        let mut allocated: Vec<DevBufId> = Vec::new();
        let mut result = Ok(());

        'outer: for pipe in &mut self.pipes {
            for buf in &mut pipe.buffers {
                let floats = buf.slab_floats(bs_x);
                for _ in 0..buf.ring_len {
                    match self.runtime.alloc(buf.device, floats) {
                        Ok(id) => {
                            buf.ring.push(id);
                            allocated.push(id);
                        }
                        Err(e) => {
                            result = Err(e);
                            break 'outer;
                        }
                    }
                }
            }
        }

        if result.is_err() {
            for id in allocated {
                self.runtime.free(id);
            }
            for pipe in &mut self.pipes {
                for buf in &mut pipe.buffers {
                    buf.ring.clear();
                }
            }
            return result;
        }

        // Peer access for every chain edge that crosses devices.
        let mut pairs = Vec::new();
        for pipe in &self.pipes {
            for buf in &pipe.buffers {
                for src in buf.srcs.iter().flatten() {
                    let src_dev = pipe.buffers[src.0].device;
                    if src_dev != buf.device {
                        pairs.push((buf.device, src_dev));
                    }
                }
            }
        }
        for (a, b) in pairs {
            self.enable_peer_access(a, b);
        }

        // Start background pinning once device residency is known.
        if self.cfg.pin_host_memory {
            self.pin_worker = Some(PinWorker::start(
                &self.host,
                Arc::clone(&self.runtime),
                self.cfg.device_ids.clone(),
            ));
        }

        self.device_memory_allocated = true;
        Ok(())
    }

    /// Free all device rings (tuner teardown between candidates).
    pub fn free_device_memory(&mut self) {
        if let Some(worker) = self.pin_worker.take() {
            worker.join();
        }
        for pipe in &mut self.pipes {
            for buf in &mut pipe.buffers {
                for id in buf.ring.drain(..) {
                    self.runtime.free(id);
                }
            }
        }
        self.device_memory_allocated = false;
    }

    /// Derive the internal time step and size the receiver path.
    pub fn prepare(&mut self, shot: &Shot) -> BwResult<ShotState> {
        if !self.device_memory_allocated {
            return Err(BwError::InvalidConfig(
                "device memory not allocated before propagation".into(),
            ));
        }

        // Courant limit for O(2) leap-frog with the O(8) stencil.
        let courant =
            COURANT_SAFE * self.cfg.courant_factor / (3.0f64.sqrt() * (C0 - C1 + C2 - C3));
        let dl_min = self.cfg.dx.min(self.cfg.dy).min(self.cfg.dz) as f64;
        let dti = courant * dl_min / self.cfg.max_velocity;
        let num_timesteps = (shot.propagation_time / dti).ceil() as i32;
        info!(
            shot = shot.id,
            dti_ms = dti * 1e3,
            num_timesteps,
            "prepared for propagation"
        );
        self.dti = dti;

        // Receiver transfer buffers: one device buffer per pipe on the
        // device producing the final velocity state, double-buffered
        // host staging, and the per-block sample lists.
        let nbx = self.cfg.num_blocks();
        let bs_x = self.cfg.block_size_x();
        let n_recv = shot.receivers.len().max(1);
        let mut dev_bufs = Vec::with_capacity(self.pipes.len());
        let mut host_pairs = Vec::with_capacity(self.pipes.len());
        let mut samples = Vec::with_capacity(self.pipes.len());
        let mut receiver_order = Vec::with_capacity(self.pipes.len());

        for pipe in &self.pipes {
            let out = self.final_velocity_buffer(pipe);
            dev_bufs.push(self.runtime.alloc(out.device, n_recv)?);
            host_pairs.push(SlotPair::new(n_recv));

            let mut per_block = Vec::with_capacity(nbx);
            let mut order_per_block = Vec::with_capacity(nbx);
            for bx in 0..nbx {
                let mut list = Vec::new();
                let mut order = Vec::new();
                for (ri, r) in shot.receivers.iter().enumerate() {
                    let in_pipe = (r.y as i32) >= pipe.y0 && (r.y as i32) <= pipe.y1;
                    let in_block = r.x / bs_x == bx;
                    if in_pipe && in_block && r.field < host::PV_FIELDS {
                        let cell = slab_cell(out, bs_x, r.x % bs_x, r.y, r.z, r.field);
                        if let Some(cell) = cell {
                            list.push(ReceiverSample {
                                receiver: ri,
                                cell,
                            });
                            order.push(ri);
                        }
                    }
                }
                per_block.push(Arc::new(list));
                order_per_block.push(order);
            }
            samples.push(per_block);
            receiver_order.push(order_per_block);
        }

        Ok(ShotState {
            num_timesteps,
            dti,
            traces: vec![Vec::new(); shot.receivers.len()],
            runtime: Arc::clone(&self.runtime),
            dev_bufs,
            host_pairs,
            samples,
            receiver_order,
            extracted_this: vec![None; self.pipes.len()],
            extracted_prev: vec![None; self.pipes.len()],
        })
    }

    fn final_velocity_buffer<'a>(&self, pipe: &'a PipeTopology) -> &'a Buffer {
        let n = pipe.buffers.len();
        // The newest compute buffer; with the output marks that is the
        // second-from-last chain entry.
        &pipe.buffers[n - 2]
    }

    /// Run a whole shot to completion.
    pub fn propagate_shot(&mut self, shot: &Shot) -> BwResult<ShotState> {
        let mut state = self.prepare(shot)?;
        while !self.propagate_one_block(&mut state)? {}
        Ok(state)
    }

    /// One block-cycle. Returns true once the shot's timestep target is
    /// reached (at a sweep boundary).
    pub fn propagate_one_block(&mut self, shot: &mut ShotState) -> BwResult<bool> {
        if self.first_call {
            // Pre-load the first input block into the host-side slots,
            // then the swap below presents it to the devices.
            self.copy_to_staging(Some(0), None, None)?;
            self.sweep_started = Instant::now();
            self.first_call = false;
        } else {
            self.iteration += 1;
        }
        let t = self.iteration;

        self.staging.swap_all();
        for pair in &mut shot.host_pairs {
            pair.swap();
        }
        // Last cycle's extraction is now on the host side of each pair.
        for i in 0..shot.extracted_this.len() {
            shot.extracted_prev[i] = shot.extracted_this[i].take();
        }

        // Record the staging decision for this cycle's outputs before
        // anything launches; pinning flips only from false to true, so
        // the recorded value stays valid for the matching drain.
        let nbx_now = self.cfg.num_blocks() as i64;
        self.out_staged_prev = self.out_staged_this;
        if let Some(b) = self.pipes[0].output_block(t) {
            let hb = (b % nbx_now) as usize;
            let unpinned = |kind: GroupKind, hb: usize| {
                !self
                    .host
                    .block(kind, hb)
                    .pinned
                    .load(std::sync::atomic::Ordering::Acquire)
            };
            let em_cbo = self.pipes[0].buffers.last().map(|b| b.cbo).unwrap_or(0);
            let em_b = t + em_cbo as i64;
            self.out_staged_this = OutStaged {
                pv: unpinned(GroupKind::Pv, hb),
                st: unpinned(GroupKind::St, hb),
                em: em_b >= 0 && unpinned(GroupKind::Em, (em_b % nbx_now) as usize),
            };
        }

        // Device work: computes, transfers and the receiver path.
        for pipe_idx in 0..self.pipes.len() {
            self.launch_pipe_cycle(pipe_idx, t, shot)?;
        }

        // CPU side: stage the next input block, drain the previous
        // output block, demux last cycle's receiver values. The earth
        // model trails at its own offset and drains separately.
        let nbx = self.cfg.num_blocks() as i64;
        let input_next = Some((t + 1).rem_euclid(nbx) as usize);
        let output_prev = self.pipes[0]
            .output_block(t - 1)
            .map(|b| (b % nbx) as usize);
        let em_prev = if self.cfg.debug {
            let em_cbo = self.pipes[0].buffers.last().map(|b| b.cbo).unwrap_or(0);
            let b = t - 1 + em_cbo as i64;
            (b >= 0).then(|| (b % nbx) as usize)
        } else {
            None
        };
        self.copy_to_staging(input_next, output_prev, em_prev)?;
        self.demux_receivers(shot);

        // Wait for every stream; any device error is fatal here.
        self.runtime.synchronize_all()?;

        Ok(self.finish_cycle(shot))
    }

    /// Launch one pipe's cycle worth of device work.
    fn launch_pipe_cycle(&self, pipe_idx: usize, t: i64, shot: &mut ShotState) -> BwResult<()> {
        let pipe = &self.pipes[pipe_idx];
        let nbx = self.cfg.num_blocks() as i64;

        // One compute-done event per device this cycle.
        let mut events: HashMap<DeviceId, Event> = HashMap::new();
        for &dev in &pipe.devices {
            events.insert(dev, Event::new());
        }

        let first_computes = self.first_compute_per_device(pipe);

        if self.cfg.slow_data_transfers {
            self.launch_inputs(pipe, t, nbx, &events)?;
            self.launch_computes(pipe, t, nbx, &[], &events)?;
        } else {
            // Longest-running kernel first: the head compute of each
            // device keeps it busy while transfers stream in.
            self.launch_computes(pipe, t, nbx, &first_computes, &HashMap::new())?;
            self.launch_inputs(pipe, t, nbx, &events)?;
            self.launch_computes_except(pipe, t, nbx, &first_computes, &events)?;
        }

        // Outputs always trail the computes that produce them.
        self.launch_outputs(pipe, t, nbx)?;
        self.launch_receiver_extraction(pipe, pipe_idx, t, nbx, shot, &events)?;
        Ok(())
    }

    fn first_compute_per_device(&self, pipe: &PipeTopology) -> Vec<usize> {
        let mut seen: Vec<DeviceId> = Vec::new();
        let mut firsts = Vec::new();
        for (i, buf) in pipe.buffers.iter().enumerate() {
            if buf.role == BufferRole::Compute && !seen.contains(&buf.device) {
                seen.push(buf.device);
                firsts.push(i);
            }
        }
        firsts
    }

    /// Launch the compute buffers listed in `only` (or all when empty),
    /// recording each device's event after its last launch when the
    /// event map is populated.
    fn launch_computes(
        &self,
        pipe: &PipeTopology,
        t: i64,
        nbx: i64,
        only: &[usize],
        events: &HashMap<DeviceId, Event>,
    ) -> BwResult<()> {
        for (i, buf) in pipe.buffers.iter().enumerate() {
            if buf.role != BufferRole::Compute {
                continue;
            }
            if !only.is_empty() && !only.contains(&i) {
                continue;
            }
            self.launch_one_compute(pipe, buf, t, nbx)?;
        }
        self.record_compute_events(events)
    }

    fn launch_computes_except(
        &self,
        pipe: &PipeTopology,
        t: i64,
        nbx: i64,
        skip: &[usize],
        events: &HashMap<DeviceId, Event>,
    ) -> BwResult<()> {
        for (i, buf) in pipe.buffers.iter().enumerate() {
            if buf.role != BufferRole::Compute || skip.contains(&i) {
                continue;
            }
            self.launch_one_compute(pipe, buf, t, nbx)?;
        }
        self.record_compute_events(events)
    }

    fn record_compute_events(&self, events: &HashMap<DeviceId, Event>) -> BwResult<()> {
        for (&dev, ev) in events {
            self.runtime.record_event(dev, StreamKind::Compute, ev)?;
        }
        Ok(())
    }

    fn launch_one_compute(
        &self,
        pipe: &PipeTopology,
        buf: &Buffer,
        t: i64,
        nbx: i64,
    ) -> BwResult<()> {
        let block = t + buf.cbo as i64;
        if block < 0 {
            return Ok(()); // pipeline still filling
        }

        let mut inputs = Vec::with_capacity(3);
        for slot in [SRC_SAME_PARITY, SRC_OTHER_PARITY, SRC_EARTH_MODEL] {
            if let Some(src) = buf.srcs[slot] {
                let src_buf = &pipe.buffers[src.0];
                let src_block = t + buf.cbo as i64; // same absolute block
                inputs.push(src_buf.slab(src_block));
            }
        }

        let kernel = match buf.parity {
            Parity::Stress => Arc::clone(&self.kernels.stress),
            Parity::Velocity => Arc::clone(&self.kernels.velocity),
        };
        let args = KernelArgs {
            device: buf.device,
            block_index: block % nbx,
            cbo: buf.cbo,
            timestep: buf.timestep,
            parity: buf.parity,
            y0: buf.cy0,
            y1: buf.cy1,
            z0: buf.z0,
            z1: buf.z1,
            dti: self.dti as f32,
            z_tiles: self.z_tiles,
            receivers: Arc::new(Vec::new()),
            inputs,
            output: buf.slab(block),
        };
        self.runtime
            .launch_kernel(buf.device, StreamKind::Compute, kernel, args)
    }

    /// Host inputs, the earth-model trail and peer transfers.
    fn launch_inputs(
        &self,
        pipe: &PipeTopology,
        t: i64,
        nbx: i64,
        events: &HashMap<DeviceId, Event>,
    ) -> BwResult<()> {
        let bs_x = self.cfg.block_size_x();

        for buf in &pipe.buffers {
            let block = t + buf.cbo as i64;
            if block < 0 {
                continue;
            }
            let host_block = (block % nbx) as usize;
            let row = buf.row_floats(bs_x);

            match buf.role {
                BufferRole::HostInput => {
                    let src = self.input_source(buf.kind, host_block);
                    self.runtime.launch_h2d(
                        buf.device,
                        StreamKind::Input,
                        &src,
                        buf.y0 as usize * row,
                        buf.slab(block),
                        0,
                        buf.width_y() * row,
                    )?;
                }
                BufferRole::EarthModel => {
                    match buf.srcs[0] {
                        None => {
                            let src = self.input_source(GroupKind::Em, host_block);
                            self.runtime.launch_h2d(
                                buf.device,
                                StreamKind::Input,
                                &src,
                                buf.y0 as usize * row,
                                buf.slab(block),
                                0,
                                buf.width_y() * row,
                            )?;
                        }
                        Some(src_id) => {
                            let src_buf = &pipe.buffers[src_id.0];
                            self.launch_peer_copy(pipe, buf, src_buf, block, bs_x, events)?;
                        }
                    }
                }
                BufferRole::PeerInput => {
                    if let Some(src_id) = buf.srcs[0] {
                        let src_buf = &pipe.buffers[src_id.0];
                        self.launch_peer_copy(pipe, buf, src_buf, block, bs_x, events)?;
                    }
                }
                BufferRole::Compute => {
                    // A receiving partial assembles its peer's half
                    // before computing its own.
                    if let Some(src_id) = buf.srcs[SRC_PEER_PARTIAL] {
                        let src_buf = &pipe.buffers[src_id.0];
                        self.launch_peer_copy(pipe, buf, src_buf, block, bs_x, events)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy the overlapping Y-rows of `src` into `dst` on the receiving
    /// device's input stream, gated on the source device's compute
    /// event when the devices differ.
    fn launch_peer_copy(
        &self,
        _pipe: &PipeTopology,
        dst: &Buffer,
        src: &Buffer,
        block: i64,
        bs_x: usize,
        events: &HashMap<DeviceId, Event>,
    ) -> BwResult<()> {
        let y_lo = dst.y0.max(src.y0);
        let y_hi = dst.y1.min(src.y1);
        if y_lo > y_hi {
            return Err(BwError::InvalidConfig(
                "peer transfer with disjoint Y-ranges".into(),
            ));
        }
        if src.ring.is_empty() {
            return Err(BwError::InvalidConfig(
                "peer transfer before device allocation".into(),
            ));
        }
        let row = dst.row_floats(bs_x);
        debug_assert_eq!(row, src.row_floats(bs_x));

        if src.device != dst.device {
            if let Some(ev) = events.get(&src.device) {
                self.runtime.wait_event(dst.device, StreamKind::Input, ev)?;
            }
        }
        self.runtime.launch_d2d(
            dst.device,
            StreamKind::Input,
            src.slab(block),
            (y_lo - src.y0) as usize * row,
            dst.slab(block),
            (y_lo - dst.y0) as usize * row,
            (y_hi - y_lo + 1) as usize * row,
        )
    }

    /// Drain the device-to-host stages into pinned blocks or staging.
    ///
    /// Wavefield outputs all drain the pipe's output block — the final
    /// stress buffer produced it one cycle earlier and still holds it
    /// in its ring — so the staging slots carry one coherent block per
    /// cycle. The earth model trails at its own offset.
    fn launch_outputs(&self, pipe: &PipeTopology, t: i64, nbx: i64) -> BwResult<()> {
        let bs_x = self.cfg.block_size_x();
        for buf in &pipe.buffers {
            if !buf.to_host {
                continue;
            }
            let block = if buf.role == BufferRole::EarthModel {
                t + buf.cbo as i64
            } else {
                t + pipe.output_cbo() as i64
            };
            if block < 0 {
                continue;
            }
            let host_block = (block % nbx) as usize;
            let row = buf.row_floats(bs_x);

            // Only the pipe-owned rows leave the device: adjacent pipes
            // share halo rows and must not both write them.
            let y_lo = pipe.y0.max(buf.y0);
            let y_hi = pipe.y1.min(buf.y1);

            let staged = match buf.kind {
                GroupKind::Pv => self.out_staged_this.pv,
                GroupKind::St => self.out_staged_this.st,
                GroupKind::Em => self.out_staged_this.em,
            };
            let dst = if !staged {
                self.host.block(buf.kind, host_block).data.clone()
            } else {
                match self.staging.device_out(buf.kind) {
                    Some(slab) => slab.clone(),
                    None => continue, // EM output without a debug session
                }
            };
            self.runtime.launch_d2h(
                buf.device,
                StreamKind::Output,
                buf.slab(block),
                (y_lo - buf.y0) as usize * row,
                &dst,
                y_lo as usize * row,
                (y_hi - y_lo + 1) as usize * row,
            )?;
        }
        Ok(())
    }

    fn launch_receiver_extraction(
        &self,
        pipe: &PipeTopology,
        pipe_idx: usize,
        t: i64,
        nbx: i64,
        shot: &mut ShotState,
        events: &HashMap<DeviceId, Event>,
    ) -> BwResult<()> {
        shot.extracted_this[pipe_idx] = None;
        let out = self.final_velocity_buffer(pipe);
        let block = t + out.cbo as i64;
        if block < 0 {
            return Ok(());
        }
        let host_block = (block % nbx) as usize;
        let list = &shot.samples[pipe_idx][host_block];
        if list.is_empty() {
            return Ok(());
        }

        // Extraction must observe this cycle's compute for the block.
        if let Some(ev) = events.get(&out.device) {
            self.runtime
                .wait_event(out.device, StreamKind::Receiver, ev)?;
        }
        let args = KernelArgs {
            device: out.device,
            block_index: host_block as i64,
            cbo: out.cbo,
            timestep: out.timestep,
            parity: out.parity,
            y0: out.y0,
            y1: out.y1,
            z0: out.z0,
            z1: out.z1,
            dti: self.dti as f32,
            z_tiles: self.z_tiles,
            receivers: Arc::clone(list),
            inputs: vec![out.slab(block)],
            output: shot.dev_bufs[pipe_idx],
        };
        self.runtime.launch_kernel(
            out.device,
            StreamKind::Receiver,
            Arc::clone(&self.kernels.extract),
            args,
        )?;
        // Stage the extracted values; demuxed next cycle.
        self.runtime.launch_d2h(
            out.device,
            StreamKind::Receiver,
            shot.dev_bufs[pipe_idx],
            0,
            shot.host_pairs[pipe_idx].slot(1),
            0,
            list.len().max(1),
        )?;
        shot.extracted_this[pipe_idx] = Some(host_block);
        Ok(())
    }

    /// De-multiplex the previous cycle's extracted values into the
    /// per-receiver traces, one worker per pipe.
    fn demux_receivers(&self, shot: &mut ShotState) {
        let mut gathered: Vec<Vec<(usize, f32)>> = Vec::with_capacity(self.pipes.len());
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for pipe_idx in 0..self.pipes.len() {
                let prev = shot.extracted_prev[pipe_idx];
                let order = &shot.receiver_order[pipe_idx];
                let pair = &shot.host_pairs[pipe_idx];
                handles.push(scope.spawn(move || {
                    let mut out = Vec::new();
                    if let Some(block) = prev {
                        let slab = pair.slot(0).lock().unwrap_or_else(|e| e.into_inner());
                        for (slot, &ri) in order[block].iter().enumerate() {
                            out.push((ri, slab[slot]));
                        }
                    }
                    out
                }));
            }
            for handle in handles {
                gathered.push(handle.join().unwrap_or_default());
            }
        });
        for list in gathered {
            for (ri, v) in list {
                shot.traces[ri].push(v);
            }
        }
    }

    /// The H2D source for a block: the pinned block itself, or the
    /// staged copy.
    fn input_source(&self, kind: GroupKind, host_block: usize) -> HostSlab {
        let block = self.host.block(kind, host_block);
        if block.pinned.load(std::sync::atomic::Ordering::Acquire) {
            block.data.clone()
        } else {
            self.staging.device_in(kind).clone()
        }
    }

    /// CPU staging traffic for the cycle: fill the host-side input
    /// slots with `input_block`, drain the host-side output slots into
    /// `output_block` (wavefields) and `em_block` (debug earth model).
    /// Pinned blocks skip both copies.
    fn copy_to_staging(
        &self,
        input_block: Option<usize>,
        output_block: Option<usize>,
        em_block: Option<usize>,
    ) -> BwResult<()> {
        let threads = crate::resolve_thread_count(0);

        if let Some(bx) = input_block {
            for kind in [GroupKind::Pv, GroupKind::St, GroupKind::Em] {
                let block = self.host.block(kind, bx);
                if block.pinned.load(std::sync::atomic::Ordering::Acquire) {
                    continue;
                }
                let src = block.data.lock().unwrap_or_else(|e| e.into_inner());
                let mut dst = self
                    .staging
                    .host_in(kind)
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                host::parallel_copy(&mut dst[..], &src[..], threads);
            }
        }

        let drains = [
            (GroupKind::Pv, output_block, self.out_staged_prev.pv),
            (GroupKind::St, output_block, self.out_staged_prev.st),
            (GroupKind::Em, em_block, self.out_staged_prev.em),
        ];
        for (kind, bx, staged) in drains {
            let (Some(bx), Some(slab)) = (bx, self.staging.host_out(kind)) else {
                continue;
            };
            // Pinned blocks received their output directly; the staging
            // decision recorded at launch time says which path ran.
            if !staged {
                continue;
            }
            let block = self.host.block(kind, bx);
            let src = slab.lock().unwrap_or_else(|e| e.into_inner());
            let mut dst = block.data.lock().unwrap_or_else(|e| e.into_inner());
            host::parallel_copy(&mut dst[..], &src[..], threads);
        }
        Ok(())
    }

    /// Sweep accounting, throughput reporting and Z-tile refinement.
    fn finish_cycle(&mut self, shot: &ShotState) -> bool {
        let t = self.iteration;
        let nbx = self.cfg.num_blocks() as i64;
        let Some(out_abs) = self.pipes[0].output_block(t) else {
            return false;
        };
        if out_abs % nbx != 0 {
            return false;
        }

        let elapsed = self.sweep_started.elapsed().as_secs_f64();
        if out_abs == 0 {
            info!(elapsed_s = elapsed, "lead-in complete (pipeline filled)");
        } else {
            let steps = self.steps_per_sweep() as i64;
            self.completed_timesteps += steps;
            let cells =
                self.cfg.nx as f64 * self.cfg.ny as f64 * self.cfg.nz as f64 * steps as f64;
            let mcells_per_s = cells / (elapsed.max(1e-9) * 1e6);
            info!(
                timesteps_from = self.completed_timesteps - steps + 1,
                timesteps_to = self.completed_timesteps,
                elapsed_s = elapsed,
                mcells_per_s = format!("{:.0}", mcells_per_s),
                "sweep complete"
            );
            if let Some(tuner) = &mut self.z_tile_tuner {
                tuner.record(mcells_per_s);
                self.z_tiles = tuner.current();
            }
        }
        self.sweep_started = Instant::now();

        self.completed_timesteps >= shot.num_timesteps as i64
    }

    /// Completed timesteps so far (whole sweeps only).
    pub fn completed_timesteps(&self) -> i64 {
        self.completed_timesteps
    }

    /// Current block-cycle iteration.
    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    /// Absolute output block at the current iteration, if the pipeline
    /// has filled.
    pub fn output_block(&self) -> Option<i64> {
        self.pipes[0].output_block(self.iteration)
    }

    /// Reset per-shot progress so another shot can run.
    pub fn reset_for_next_shot(&mut self) {
        self.iteration = 0;
        self.first_call = true;
        self.completed_timesteps = 0;
        self.out_staged_this = OutStaged::default();
        self.out_staged_prev = OutStaged::default();
        self.runtime.reset_transfer_counters();
    }
}

impl Drop for Propagator {
    fn drop(&mut self) {
        self.free_device_memory();
    }
}

/// Flat index of `(x, y, z, field)` within a buffer's slab, or `None`
/// when the cell lies outside the slab.
fn slab_cell(buf: &Buffer, bs_x: usize, xi: usize, y: usize, z: usize, field: usize) -> Option<usize> {
    let y = y as i32;
    let z = z as i32;
    if y < buf.y0 || y > buf.y1 || z < buf.z0 || z > buf.z1 {
        return None;
    }
    let one_wf = bs_x * buf.depth_z();
    let nf = buf.kind.fields();
    Some(
        (y - buf.y0) as usize * one_wf * nf
            + field * one_wf
            + (z - buf.z0) as usize * bs_x
            + xi,
    )
}
