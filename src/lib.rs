//! blockwave — two engines for large-scale seismic volume processing.
//!
//! - [`codec`]: a lossy block-wavelet codec for dense 3-D `f32` volumes.
//!   Volumes are tiled into power-of-two blocks, each block is run through
//!   a separable 3-D lifting wavelet, quantised against the volume's global
//!   RMS and run-length encoded into a self-describing byte stream.
//! - [`propagator`]: a pipelined multi-device finite-difference sweep
//!   scheduler. The volume streams through chains of device buffers one
//!   X-block per cycle while host↔device transfers overlap with compute.
//!
//! The two engines share the SIMD primitives in [`simd`] and the error
//! type below. The per-device compute kernels are external; the scheduler
//! only depends on the [`propagator::device::SubstepKernel`] contract.

pub mod codec;
pub mod propagator;
pub mod simd;

/// Error type for blockwave operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum BwError {
    /// Block dimensions are not powers of two or fall outside the
    /// supported range.
    InvalidBlockSize {
        /// The offending extent (bx, by or bz).
        axis: char,
        /// The value provided.
        size: usize,
    },
    /// Volume dimensions are zero or smaller than one block.
    InvalidVolumeDims {
        /// The axis name.
        axis: char,
        /// The value provided.
        size: usize,
    },
    /// Output buffer is too small to hold the result.
    BufferTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes provided.
        provided: usize,
    },
    /// Configuration is missing a required field or holds an
    /// unsupported value.
    InvalidConfig(String),
    /// Host or device allocation failed or exceeded the device budget.
    Resource {
        /// Device the allocation was destined for, if any.
        device: Option<i32>,
        /// Bytes requested.
        requested: u64,
        /// Bytes available.
        available: u64,
    },
    /// Compressed data is inconsistent (bad header, out-of-range offset,
    /// record overruns the arena).
    Corrupt(&'static str),
    /// A device stream reported an error.
    Transport {
        /// Device the stream belongs to.
        device: i32,
        /// Stream description.
        stream: &'static str,
        /// What the worker reported.
        detail: String,
    },
    /// Input contains NaN or Inf.
    NonFiniteInput {
        /// Flat index of the first offending value.
        index: usize,
    },
}

impl std::fmt::Display for BwError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBlockSize { axis, size } => write!(
                f,
                "invalid block size: b{} = {} (must be a power of two in [{}, {}])",
                axis,
                size,
                codec::MIN_BLOCK,
                codec::MAX_BLOCK
            ),
            Self::InvalidVolumeDims { axis, size } => {
                write!(f, "invalid volume dimension: n{} = {}", axis, size)
            }
            Self::BufferTooSmall { required, provided } => write!(
                f,
                "output buffer too small: need {} bytes, got {}",
                required, provided
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Resource {
                device,
                requested,
                available,
            } => match device {
                Some(d) => write!(
                    f,
                    "allocation of {} bytes failed on device {} ({} available)",
                    requested, d, available
                ),
                None => write!(
                    f,
                    "host allocation of {} bytes failed ({} available)",
                    requested, available
                ),
            },
            Self::Corrupt(what) => write!(f, "corrupt compressed data: {}", what),
            Self::Transport {
                device,
                stream,
                detail,
            } => write!(f, "device {} {} stream error: {}", device, stream, detail),
            Self::NonFiniteInput { index } => {
                write!(f, "non-finite value in input volume at index {}", index)
            }
        }
    }
}

impl std::error::Error for BwError {}

/// Convenience alias used throughout the crate.
pub type BwResult<T> = Result<T, BwError>;

/// Resolve a thread-count option: 0 means all available cores.
pub(crate) fn resolve_thread_count(threads: usize) -> usize {
    if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        threads
    }
}
