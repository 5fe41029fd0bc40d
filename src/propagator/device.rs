//! Device runtime: streams, transfers, kernel launches.
//!
//! The propagation kernels themselves are external; the scheduler talks
//! to a CUDA-like runtime through this module. Each device is served by
//! one worker thread consuming a FIFO command channel, so commands on a
//! device execute in host launch order — exactly the ordering contract
//! the scheduler relies on. Cross-device dependencies (peer copies that
//! read another device's freshly computed block) are expressed with
//! one-shot events recorded and awaited on streams.
//!
//! # Threading model
//!
//! - **Launches** (host thread): enqueue a command tagged with the next
//!   device sequence number and remember it as the stream's fence.
//! - **Worker** (one per device): executes commands in order, bumps the
//!   executed counter, parks on `Wait` until the event is recorded.
//! - **Synchronize** (host thread): blocks until the executed counter
//!   passes the stream's fence, then surfaces any worker error as a
//!   Transport error.
//!
//! Device memory is modelled as a heap of `f32` slabs with per-device
//! capacity accounting; allocation failure is how the auto-tuner learns
//! a configuration does not fit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::{BwError, BwResult};

/// Device identifier as configured in the job (CUDA-style ordinal).
pub type DeviceId = i32;

/// One of the four logical streams each device owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Compute kernel launches.
    Compute,
    /// Host-to-device and peer input transfers.
    Input,
    /// Device-to-host output transfers.
    Output,
    /// Receiver extraction and its transfers.
    Receiver,
}

impl StreamKind {
    pub(crate) const ALL: [StreamKind; 4] = [
        StreamKind::Compute,
        StreamKind::Input,
        StreamKind::Output,
        StreamKind::Receiver,
    ];

    fn index(self) -> usize {
        match self {
            StreamKind::Compute => 0,
            StreamKind::Input => 1,
            StreamKind::Output => 2,
            StreamKind::Receiver => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            StreamKind::Compute => "compute",
            StreamKind::Input => "input",
            StreamKind::Output => "output",
            StreamKind::Receiver => "receiver",
        }
    }
}

/// Handle to a device memory slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevBufId(u64);

/// Host-visible slab shared with device workers (pinned staging slot or
/// a pinned host block).
pub type HostSlab = Arc<Mutex<super::host::PageSlab>>;

/// Allocate a host slab of the given float count.
pub fn host_slab(floats: usize) -> HostSlab {
    Arc::new(Mutex::new(super::host::PageSlab::zeroed(floats)))
}

/// One-shot ordering token between streams.
#[derive(Clone)]
pub struct Event(Arc<(Mutex<bool>, Condvar)>);

impl Event {
    pub fn new() -> Self {
        Event(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn record(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = cvar.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Sub-step parity: which half-update a kernel performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// Stress (T) half-update.
    Stress,
    /// Particle-velocity (V) half-update.
    Velocity,
}

/// One receiver sample to extract from a slab.
#[derive(Debug, Clone)]
pub struct ReceiverSample {
    /// Index of the receiver in the shot (selects the output slot).
    pub receiver: usize,
    /// Flat index into the input slab.
    pub cell: usize,
}

/// Arguments handed to a kernel launch.
#[derive(Clone)]
pub struct KernelArgs {
    pub device: DeviceId,
    /// Absolute block index (iteration + cbo); never negative at launch.
    pub block_index: i64,
    pub cbo: i32,
    pub timestep: i32,
    pub parity: Parity,
    pub y0: i32,
    pub y1: i32,
    pub z0: i32,
    pub z1: i32,
    pub dti: f32,
    /// Internal Z-tile count chosen by the tuner; fixed within a cycle.
    pub z_tiles: usize,
    /// Receiver samples when this launch is an extraction, else empty.
    pub receivers: Arc<Vec<ReceiverSample>>,
    pub inputs: Vec<DevBufId>,
    pub output: DevBufId,
}

/// Slab views a kernel operates on: read-only inputs, one output.
pub struct KernelMem<'a> {
    pub inputs: Vec<&'a [f32]>,
    pub output: &'a mut [f32],
}

/// The per-device compute kernel contract.
///
/// Implementations live outside this crate (the production kernels are
/// device code); the scheduler only depends on this signature plus the
/// stream discipline. Tests use software stubs.
pub trait SubstepKernel: Send + Sync {
    /// Run one sub-step (or extraction) on the given slabs. Errors are
    /// treated as sticky stream failures, fatal at the next synchronize.
    fn launch(&self, args: &KernelArgs, mem: &mut KernelMem<'_>) -> Result<(), String>;
}

enum Cmd {
    H2D {
        src: HostSlab,
        src_off: usize,
        dst: DevBufId,
        dst_off: usize,
        len: usize,
    },
    D2H {
        src: DevBufId,
        src_off: usize,
        dst: HostSlab,
        dst_off: usize,
        len: usize,
    },
    D2D {
        src: DevBufId,
        src_off: usize,
        dst: DevBufId,
        dst_off: usize,
        len: usize,
    },
    Kernel {
        kernel: Arc<dyn SubstepKernel>,
        args: KernelArgs,
    },
    Record(Event),
    Wait(Event),
}

struct WorkItem {
    seq: u64,
    stream: StreamKind,
    cmd: Cmd,
}

/// Executed-sequence tracker shared between a worker and the host.
struct Progress {
    executed: Mutex<u64>,
    cvar: Condvar,
}

struct DeviceState {
    id: DeviceId,
    tx: Sender<WorkItem>,
    progress: Arc<Progress>,
    /// Last launched sequence per stream, 0 = nothing launched.
    fences: [AtomicU64; 4],
    /// Lazily "created" streams (bookkeeping to mirror the driver API).
    created: [AtomicU64; 4],
    error: Arc<Mutex<Option<(&'static str, String)>>>,
    next_seq: AtomicU64,
    capacity: u64,
    used: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Shared heap of device slabs. Peer copies read and write across
/// devices, so one map serves them all; workers lock per command.
struct Heap {
    bufs: HashMap<u64, Box<[f32]>>,
}

/// The device runtime. One instance drives all configured devices.
pub struct DeviceRuntime {
    devices: Vec<DeviceState>,
    heap: Arc<Mutex<Heap>>,
    next_buf: AtomicU64,
    /// Which device currently owns each allocation (for free accounting).
    owners: Mutex<HashMap<u64, usize>>,
    h2d_bytes: AtomicU64,
    d2h_bytes: AtomicU64,
}

impl DeviceRuntime {
    /// Spin up one worker per device with the given memory capacities
    /// (bytes).
    pub fn new(capacities: &[(DeviceId, u64)]) -> BwResult<Arc<Self>> {
        if capacities.is_empty() {
            return Err(BwError::InvalidConfig("no devices configured".into()));
        }
        let heap = Arc::new(Mutex::new(Heap {
            bufs: HashMap::new(),
        }));

        let mut devices = Vec::with_capacity(capacities.len());
        for &(id, capacity) in capacities {
            let (tx, rx) = mpsc::channel::<WorkItem>();
            let progress = Arc::new(Progress {
                executed: Mutex::new(0),
                cvar: Condvar::new(),
            });
            let error: Arc<Mutex<Option<(&'static str, String)>>> = Arc::new(Mutex::new(None));
            let worker_heap = Arc::clone(&heap);
            let worker_progress = Arc::clone(&progress);
            let worker_error = Arc::clone(&error);
            let join = std::thread::Builder::new()
                .name(format!("device-{}", id))
                .spawn(move || device_worker(rx, worker_heap, worker_progress, worker_error))
                .map_err(|e| BwError::InvalidConfig(format!("spawn device worker: {}", e)))?;
            devices.push(DeviceState {
                id,
                tx,
                progress,
                fences: Default::default(),
                created: Default::default(),
                error,
                next_seq: AtomicU64::new(0),
                capacity,
                used: AtomicU64::new(0),
                join: Mutex::new(Some(join)),
            });
        }

        Ok(Arc::new(DeviceRuntime {
            devices,
            heap,
            next_buf: AtomicU64::new(1),
            owners: Mutex::new(HashMap::new()),
            h2d_bytes: AtomicU64::new(0),
            d2h_bytes: AtomicU64::new(0),
        }))
    }

    /// Configured device count.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, id: DeviceId) -> BwResult<&DeviceState> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| BwError::InvalidConfig(format!("unknown device id {}", id)))
    }

    /// Allocate a zeroed slab of `floats` on `dev`.
    ///
    /// Fails with a Resource error when the device budget is exceeded —
    /// the tuner treats that as "configuration not viable".
    pub fn alloc(&self, dev: DeviceId, floats: usize) -> BwResult<DevBufId> {
        let state = self.device(dev)?;
        let bytes = (floats * 4) as u64;
        let used = state.used.load(Ordering::Relaxed);
        if used + bytes > state.capacity {
            return Err(BwError::Resource {
                device: Some(dev),
                requested: bytes,
                available: state.capacity.saturating_sub(used),
            });
        }
        state.used.fetch_add(bytes, Ordering::Relaxed);

        let id = self.next_buf.fetch_add(1, Ordering::Relaxed);
        let idx = self.devices.iter().position(|d| d.id == dev).unwrap_or(0);
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bufs
            .insert(id, vec![0.0f32; floats].into_boxed_slice());
        self.owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, idx);
        Ok(DevBufId(id))
    }

    /// Free a slab and return its bytes to the owner's budget.
    pub fn free(&self, buf: DevBufId) {
        let removed = self
            .heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bufs
            .remove(&buf.0);
        if let Some(slab) = removed {
            let owner = self
                .owners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&buf.0);
            if let Some(idx) = owner {
                self.devices[idx]
                    .used
                    .fetch_sub((slab.len() * 4) as u64, Ordering::Relaxed);
            }
        }
    }

    /// Remaining allocation budget on a device, in bytes.
    pub fn free_bytes(&self, dev: DeviceId) -> u64 {
        self.device(dev)
            .map(|d| d.capacity.saturating_sub(d.used.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Total bytes moved host-to-device so far.
    pub fn h2d_bytes(&self) -> u64 {
        self.h2d_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes moved device-to-host so far.
    pub fn d2h_bytes(&self) -> u64 {
        self.d2h_bytes.load(Ordering::Relaxed)
    }

    /// Reset the transfer counters (per-sweep reporting).
    pub fn reset_transfer_counters(&self) {
        self.h2d_bytes.store(0, Ordering::Relaxed);
        self.d2h_bytes.store(0, Ordering::Relaxed);
    }

    fn launch(&self, dev: DeviceId, stream: StreamKind, cmd: Cmd) -> BwResult<()> {
        let state = self.device(dev)?;
        // Lazy stream creation, mirroring the driver API shape.
        if state.created[stream.index()].swap(1, Ordering::Relaxed) == 0 {
            debug!(device = dev, stream = stream.name(), "stream created");
        }
        let seq = state.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        state.fences[stream.index()].store(seq, Ordering::Relaxed);
        state
            .tx
            .send(WorkItem { seq, stream, cmd })
            .map_err(|_| BwError::Transport {
                device: dev,
                stream: stream.name(),
                detail: "worker gone".into(),
            })
    }

    /// Enqueue a host-to-device range copy (f32 offsets and length).
    pub fn launch_h2d(
        &self,
        dev: DeviceId,
        stream: StreamKind,
        src: &HostSlab,
        src_off: usize,
        dst: DevBufId,
        dst_off: usize,
        len: usize,
    ) -> BwResult<()> {
        self.h2d_bytes.fetch_add((len * 4) as u64, Ordering::Relaxed);
        self.launch(
            dev,
            stream,
            Cmd::H2D {
                src: Arc::clone(src),
                src_off,
                dst,
                dst_off,
                len,
            },
        )
    }

    /// Enqueue a device-to-host range copy.
    pub fn launch_d2h(
        &self,
        dev: DeviceId,
        stream: StreamKind,
        src: DevBufId,
        src_off: usize,
        dst: &HostSlab,
        dst_off: usize,
        len: usize,
    ) -> BwResult<()> {
        self.d2h_bytes.fetch_add((len * 4) as u64, Ordering::Relaxed);
        self.launch(
            dev,
            stream,
            Cmd::D2H {
                src,
                src_off,
                dst: Arc::clone(dst),
                dst_off,
                len,
            },
        )
    }

    /// Enqueue a device-to-device (peer) range copy on `dev`'s stream.
    pub fn launch_d2d(
        &self,
        dev: DeviceId,
        stream: StreamKind,
        src: DevBufId,
        src_off: usize,
        dst: DevBufId,
        dst_off: usize,
        len: usize,
    ) -> BwResult<()> {
        self.launch(
            dev,
            stream,
            Cmd::D2D {
                src,
                src_off,
                dst,
                dst_off,
                len,
            },
        )
    }

    /// Enqueue a kernel launch.
    pub fn launch_kernel(
        &self,
        dev: DeviceId,
        stream: StreamKind,
        kernel: Arc<dyn SubstepKernel>,
        args: KernelArgs,
    ) -> BwResult<()> {
        self.launch(dev, stream, Cmd::Kernel { kernel, args })
    }

    /// Record `event` on a stream: it fires once every prior command on
    /// that device has executed.
    pub fn record_event(&self, dev: DeviceId, stream: StreamKind, event: &Event) -> BwResult<()> {
        self.launch(dev, stream, Cmd::Record(event.clone()))
    }

    /// Make a stream wait for `event` before executing later commands.
    pub fn wait_event(&self, dev: DeviceId, stream: StreamKind, event: &Event) -> BwResult<()> {
        self.launch(dev, stream, Cmd::Wait(event.clone()))
    }

    /// Block until every command launched on the stream has executed,
    /// then surface any sticky worker error.
    pub fn synchronize(&self, dev: DeviceId, stream: StreamKind) -> BwResult<()> {
        let state = self.device(dev)?;
        let fence = state.fences[stream.index()].load(Ordering::Relaxed);
        let mut executed = state
            .progress
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while *executed < fence {
            executed = state
                .progress
                .cvar
                .wait(executed)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(executed);

        if let Some((stream, detail)) = state
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(BwError::Transport {
                device: dev,
                stream,
                detail,
            });
        }
        Ok(())
    }

    /// Synchronize every created stream on every device.
    pub fn synchronize_all(&self) -> BwResult<()> {
        for state in &self.devices {
            for kind in StreamKind::ALL {
                if state.created[kind.index()].load(Ordering::Relaxed) != 0 {
                    self.synchronize(state.id, kind)?;
                }
            }
        }
        Ok(())
    }

    /// Copy a device slab back to a host vector (debug and tests).
    pub fn read_back(&self, buf: DevBufId) -> BwResult<Vec<f32>> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bufs
            .get(&buf.0)
            .map(|b| b.to_vec())
            .ok_or(BwError::Corrupt("read_back of freed device buffer"))
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        // Close each channel first so the worker's recv loop ends, then
        // join it.
        for state in self.devices.drain(..) {
            let DeviceState { tx, join, .. } = state;
            drop(tx);
            let handle = match join.into_inner() {
                Ok(h) => h,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

fn device_worker(
    rx: Receiver<WorkItem>,
    heap: Arc<Mutex<Heap>>,
    progress: Arc<Progress>,
    error: Arc<Mutex<Option<(&'static str, String)>>>,
) {
    while let Ok(item) = rx.recv() {
        let poisoned = error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        match item.cmd {
            // Events fire even after an error so peers never deadlock.
            Cmd::Record(ev) => ev.record(),
            Cmd::Wait(ev) => {
                if !poisoned {
                    ev.wait();
                }
            }
            cmd if poisoned => drop(cmd),
            cmd => {
                if let Err(detail) = execute(&heap, cmd) {
                    *error.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some((item.stream.name(), detail));
                }
            }
        }

        let mut executed = progress.executed.lock().unwrap_or_else(|e| e.into_inner());
        *executed = item.seq;
        progress.cvar.notify_all();
    }
}

fn execute(heap: &Mutex<Heap>, cmd: Cmd) -> Result<(), String> {
    match cmd {
        Cmd::H2D {
            src,
            src_off,
            dst,
            dst_off,
            len,
        } => {
            let src = src.lock().unwrap_or_else(|e| e.into_inner());
            let mut heap = heap.lock().unwrap_or_else(|e| e.into_inner());
            let dst = heap
                .bufs
                .get_mut(&dst.0)
                .ok_or_else(|| "h2d into freed buffer".to_string())?;
            range_check(src.len(), src_off, len, "h2d source")?;
            range_check(dst.len(), dst_off, len, "h2d destination")?;
            dst[dst_off..dst_off + len].copy_from_slice(&src[src_off..src_off + len]);
            Ok(())
        }
        Cmd::D2H {
            src,
            src_off,
            dst,
            dst_off,
            len,
        } => {
            let heap = heap.lock().unwrap_or_else(|e| e.into_inner());
            let src = heap
                .bufs
                .get(&src.0)
                .ok_or_else(|| "d2h from freed buffer".to_string())?;
            let mut dst = dst.lock().unwrap_or_else(|e| e.into_inner());
            range_check(src.len(), src_off, len, "d2h source")?;
            range_check(dst.len(), dst_off, len, "d2h destination")?;
            dst[dst_off..dst_off + len].copy_from_slice(&src[src_off..src_off + len]);
            Ok(())
        }
        Cmd::D2D {
            src,
            src_off,
            dst,
            dst_off,
            len,
        } => {
            let mut heap = heap.lock().unwrap_or_else(|e| e.into_inner());
            let src_data = {
                let s = heap
                    .bufs
                    .get(&src.0)
                    .ok_or_else(|| "d2d from freed buffer".to_string())?;
                range_check(s.len(), src_off, len, "d2d source")?;
                s[src_off..src_off + len].to_vec()
            };
            let dst = heap
                .bufs
                .get_mut(&dst.0)
                .ok_or_else(|| "d2d into freed buffer".to_string())?;
            range_check(dst.len(), dst_off, len, "d2d destination")?;
            dst[dst_off..dst_off + len].copy_from_slice(&src_data);
            Ok(())
        }
        Cmd::Kernel { kernel, args } => {
            let mut heap = heap.lock().unwrap_or_else(|e| e.into_inner());
            let mut output = heap
                .bufs
                .remove(&args.output.0)
                .ok_or_else(|| "kernel output buffer freed".to_string())?;
            let result = {
                let inputs: Result<Vec<&[f32]>, String> = args
                    .inputs
                    .iter()
                    .map(|id| {
                        heap.bufs
                            .get(&id.0)
                            .map(|b| &b[..])
                            .ok_or_else(|| "kernel input buffer freed".to_string())
                    })
                    .collect();
                match inputs {
                    Ok(inputs) => {
                        let mut mem = KernelMem {
                            inputs,
                            output: &mut output,
                        };
                        kernel.launch(&args, &mut mem)
                    }
                    Err(e) => Err(e),
                }
            };
            heap.bufs.insert(args.output.0, output);
            result
        }
        Cmd::Record(_) | Cmd::Wait(_) => Ok(()),
    }
}

fn range_check(len: usize, off: usize, n: usize, what: &str) -> Result<(), String> {
    if off + n > len {
        Err(format!(
            "{} range {}..{} exceeds slab of {}",
            what,
            off,
            off + n,
            len
        ))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stub kernels for scheduler tests
// ---------------------------------------------------------------------------

/// Copies the first input to the output. Stands in for a real sub-step
/// when only data movement is under test.
pub struct CopyKernel;

impl SubstepKernel for CopyKernel {
    fn launch(&self, _args: &KernelArgs, mem: &mut KernelMem<'_>) -> Result<(), String> {
        let src = mem
            .inputs
            .first()
            .ok_or_else(|| "copy kernel needs one input".to_string())?;
        let n = src.len().min(mem.output.len());
        mem.output[..n].copy_from_slice(&src[..n]);
        Ok(())
    }
}

/// Copies the first input and adds the launch's cbo to every cell. Each
/// traversed sub-step leaves a fingerprint, which the scheduler tests
/// sum against the expected chain.
pub struct AddCboKernel;

impl SubstepKernel for AddCboKernel {
    fn launch(&self, args: &KernelArgs, mem: &mut KernelMem<'_>) -> Result<(), String> {
        let src = mem
            .inputs
            .first()
            .ok_or_else(|| "add-cbo kernel needs one input".to_string())?;
        let n = src.len().min(mem.output.len());
        let add = args.cbo as f32;
        for i in 0..n {
            mem.output[i] = src[i] + add;
        }
        Ok(())
    }
}

/// Samples the listed cells of the first input into the output slots.
pub struct SampleKernel;

impl SubstepKernel for SampleKernel {
    fn launch(&self, args: &KernelArgs, mem: &mut KernelMem<'_>) -> Result<(), String> {
        let src = mem
            .inputs
            .first()
            .ok_or_else(|| "sample kernel needs one input".to_string())?;
        for sample in args.receivers.iter() {
            let v = *src
                .get(sample.cell)
                .ok_or_else(|| format!("receiver cell {} out of slab", sample.cell))?;
            *mem.output
                .get_mut(sample.receiver)
                .ok_or_else(|| format!("receiver slot {} out of buffer", sample.receiver))? = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_one() -> Arc<DeviceRuntime> {
        DeviceRuntime::new(&[(0, 64 << 20)]).unwrap()
    }

    #[test]
    fn test_alloc_respects_capacity() {
        let rt = DeviceRuntime::new(&[(0, 1024)]).unwrap();
        let a = rt.alloc(0, 128).unwrap(); // 512 bytes
        assert!(rt.alloc(0, 200).is_err()); // 800 bytes > 512 left
        rt.free(a);
        assert!(rt.alloc(0, 200).is_ok());
    }

    #[test]
    fn test_free_bytes_tracks_usage() {
        let rt = DeviceRuntime::new(&[(0, 4096)]).unwrap();
        assert_eq!(rt.free_bytes(0), 4096);
        let _a = rt.alloc(0, 256).unwrap();
        assert_eq!(rt.free_bytes(0), 3072);
    }

    #[test]
    fn test_h2d_d2h_round_trip() {
        let rt = runtime_one();
        let buf = rt.alloc(0, 16).unwrap();
        let src = host_slab(16);
        src.lock().unwrap().iter_mut().enumerate().for_each(|(i, v)| *v = i as f32);
        let dst = host_slab(16);

        rt.launch_h2d(0, StreamKind::Input, &src, 0, buf, 0, 16).unwrap();
        rt.launch_d2h(0, StreamKind::Output, buf, 0, &dst, 0, 16).unwrap();
        rt.synchronize(0, StreamKind::Input).unwrap();
        rt.synchronize(0, StreamKind::Output).unwrap();

        let got = dst.lock().unwrap();
        assert_eq!(got[5], 5.0);
        assert_eq!(rt.h2d_bytes(), 64);
        assert_eq!(rt.d2h_bytes(), 64);
    }

    #[test]
    fn test_commands_execute_in_launch_order() {
        let rt = runtime_one();
        let buf = rt.alloc(0, 8).unwrap();
        let a = host_slab(8);
        let b = host_slab(8);
        a.lock().unwrap().fill(1.0);
        b.lock().unwrap().fill(2.0);
        let out = host_slab(8);

        // Later H2D overwrites the earlier one before the D2H reads.
        rt.launch_h2d(0, StreamKind::Input, &a, 0, buf, 0, 8).unwrap();
        rt.launch_h2d(0, StreamKind::Input, &b, 0, buf, 0, 8).unwrap();
        rt.launch_d2h(0, StreamKind::Output, buf, 0, &out, 0, 8).unwrap();
        rt.synchronize_all().unwrap();
        assert_eq!(out.lock().unwrap()[0], 2.0);
    }

    #[test]
    fn test_peer_copy_with_event_ordering() {
        let rt = DeviceRuntime::new(&[(0, 1 << 20), (1, 1 << 20)]).unwrap();
        let src = rt.alloc(0, 8).unwrap();
        let dst = rt.alloc(1, 8).unwrap();
        let host = host_slab(8);
        host.lock().unwrap().fill(7.0);

        let ev = Event::new();
        rt.launch_h2d(0, StreamKind::Input, &host, 0, src, 0, 8).unwrap();
        rt.record_event(0, StreamKind::Input, &ev).unwrap();
        rt.wait_event(1, StreamKind::Input, &ev).unwrap();
        rt.launch_d2d(1, StreamKind::Input, src, 0, dst, 0, 8).unwrap();
        rt.synchronize_all().unwrap();
        assert_eq!(rt.read_back(dst).unwrap()[3], 7.0);
    }

    #[test]
    fn test_kernel_error_is_sticky_transport() {
        struct Failing;
        impl SubstepKernel for Failing {
            fn launch(&self, _: &KernelArgs, _: &mut KernelMem<'_>) -> Result<(), String> {
                Err("boom".into())
            }
        }

        let rt = runtime_one();
        let buf = rt.alloc(0, 8).unwrap();
        let args = KernelArgs {
            device: 0,
            block_index: 0,
            cbo: 0,
            timestep: 0,
            parity: Parity::Stress,
            y0: 0,
            y1: 0,
            z0: 0,
            z1: 0,
            dti: 0.0,
            z_tiles: 1,
            receivers: Arc::new(Vec::new()),
            inputs: vec![buf],
            output: buf,
        };
        rt.launch_kernel(0, StreamKind::Compute, Arc::new(Failing), args)
            .unwrap();
        let err = rt.synchronize(0, StreamKind::Compute).unwrap_err();
        assert!(matches!(err, BwError::Transport { device: 0, .. }));
    }

    #[test]
    fn test_add_cbo_kernel_fingerprints() {
        let rt = runtime_one();
        let a = rt.alloc(0, 4).unwrap();
        let b = rt.alloc(0, 4).unwrap();
        let host = host_slab(4);
        host.lock().unwrap().fill(10.0);
        rt.launch_h2d(0, StreamKind::Input, &host, 0, a, 0, 4).unwrap();
        let args = KernelArgs {
            device: 0,
            block_index: 0,
            cbo: -3,
            timestep: 0,
            parity: Parity::Velocity,
            y0: 0,
            y1: 0,
            z0: 0,
            z1: 0,
            dti: 0.0,
            z_tiles: 1,
            receivers: Arc::new(Vec::new()),
            inputs: vec![a],
            output: b,
        };
        rt.launch_kernel(0, StreamKind::Compute, Arc::new(AddCboKernel), args)
            .unwrap();
        rt.synchronize_all().unwrap();
        assert_eq!(rt.read_back(b).unwrap(), vec![7.0; 4]);
    }
}
