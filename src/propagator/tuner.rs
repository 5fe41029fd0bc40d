//! Configuration auto-tuning.
//!
//! The sweep probes pipe counts and steps-per-device, derives the
//! largest device count per pipe whose block budget still fits the
//! volume, skips configurations whose device memory does not fit, and
//! ranks the survivors by measured block-cycle throughput. Each
//! candidate is an immutable record; measurements are memoised so a
//! configuration is never timed twice, and the 8-pipe branch is cut
//! short once it measures slower than 4-pipe.
//!
//! During a live run the internal Z-tile count keeps being refined:
//! at sweep boundaries the observed rates are sorted and the slower
//! half of the candidate set is discarded, never changing mid-cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::device::DeviceRuntime;
use super::{JobConfig, KernelSet, Propagator, Shot};
use crate::{BwError, BwResult};

/// One measured configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneCandidate {
    pub num_pipes: usize,
    pub steps_per_device: usize,
    pub devices_per_pipe: usize,
    /// Best internal Z-tile count found for this configuration.
    pub z_tiles: usize,
    /// Measured throughput at that tiling.
    pub mcells_per_s: f64,
}

/// The sweep's outcome.
#[derive(Debug, Clone)]
pub struct TuneReport {
    pub best: TuneCandidate,
    /// Every configuration that survived the memory checks, measured.
    pub measured: Vec<TuneCandidate>,
}

/// Pipe counts the sweep tries, capped by the device count.
const PIPE_CANDIDATES: [usize; 4] = [1, 2, 4, 8];
/// Steps-per-device range.
const STEP_RANGE: std::ops::RangeInclusive<usize> = 3..=6;

/// Largest devices-per-pipe whose chain still fits `NbX - 2` blocks
/// (room for the halo), or None when even one device does not fit.
fn devices_per_pipe(available: usize, steps: usize, nbx: usize) -> Option<usize> {
    let budget = nbx.saturating_sub(2);
    let mut best = None;
    for g in 1..=available {
        // A g-device chain spans 2 sub-steps per step per device plus
        // the head input pair and the hand-off pairs.
        let span = 2 * steps * g + 2 * g + 2;
        if span <= budget {
            best = Some(g);
        }
    }
    best
}

/// Sweep configurations and return the ranked report. `probe_cycles`
/// block-cycles are timed per Z-tile candidate after the pipeline
/// fills.
pub fn auto_tune(
    base: &JobConfig,
    runtime: &Arc<DeviceRuntime>,
    kernels: &KernelSet,
    z_tile_candidates: &[usize],
    probe_cycles: usize,
) -> BwResult<TuneReport> {
    let ndev = base.device_ids.len();
    let nbx = base.num_blocks();
    let z_tiles: Vec<usize> = if z_tile_candidates.is_empty() {
        vec![1]
    } else {
        z_tile_candidates.to_vec()
    };

    let mut memo: HashMap<(usize, usize), TuneCandidate> = HashMap::new();
    let mut measured = Vec::new();
    let mut best: Option<TuneCandidate> = None;
    let mut best_4pipe: Option<f64> = None;
    let mut abandon_8pipe = false;

    for &num_pipes in &PIPE_CANDIDATES {
        if num_pipes > ndev || ndev % num_pipes != 0 {
            continue;
        }
        for steps in STEP_RANGE {
            if abandon_8pipe && num_pipes == 8 {
                break;
            }
            if let Some(cand) = memo.get(&(num_pipes, steps)) {
                measured.push(*cand);
                continue;
            }
            let Some(g) = devices_per_pipe(ndev / num_pipes, steps, nbx) else {
                debug!(num_pipes, steps, "block budget too small, skipped");
                continue;
            };

            let mut cfg = base.clone();
            cfg.num_pipes = num_pipes;
            cfg.steps_per_device = steps;
            cfg.device_ids = base.device_ids[..num_pipes * g].to_vec();

            match probe_configuration(&cfg, runtime, kernels, &z_tiles, probe_cycles) {
                Ok(cand) => {
                    info!(
                        num_pipes,
                        steps,
                        devices_per_pipe = g,
                        z_tiles = cand.z_tiles,
                        mcells_per_s = format!("{:.0}", cand.mcells_per_s),
                        "candidate measured"
                    );
                    memo.insert((num_pipes, steps), cand);
                    measured.push(cand);
                    if num_pipes == 4 {
                        best_4pipe = Some(
                            best_4pipe.map_or(cand.mcells_per_s, |b: f64| {
                                b.max(cand.mcells_per_s)
                            }),
                        );
                    }
                    if num_pipes == 8 {
                        if let Some(b4) = best_4pipe {
                            if cand.mcells_per_s < b4 {
                                warn!("8-pipe slower than 4-pipe, abandoning the branch");
                                abandon_8pipe = true;
                            }
                        }
                    }
                    let better = best
                        .map(|b| cand.mcells_per_s > b.mcells_per_s)
                        .unwrap_or(true);
                    if better {
                        best = Some(cand);
                    }
                }
                Err(BwError::Resource { device, .. }) => {
                    debug!(num_pipes, steps, ?device, "allocation failed, skipped");
                }
                Err(e) => return Err(e),
            }
        }
    }

    let best = best.ok_or_else(|| {
        BwError::InvalidConfig("no configuration survived the tuning sweep".into())
    })?;
    info!(
        num_pipes = best.num_pipes,
        steps = best.steps_per_device,
        z_tiles = best.z_tiles,
        mcells_per_s = format!("{:.0}", best.mcells_per_s),
        "tuning sweep finished"
    );
    Ok(TuneReport { best, measured })
}

/// Build, fill and time one configuration; the propagator is destroyed
/// on return.
fn probe_configuration(
    cfg: &JobConfig,
    runtime: &Arc<DeviceRuntime>,
    kernels: &KernelSet,
    z_tiles: &[usize],
    probe_cycles: usize,
) -> BwResult<TuneCandidate> {
    let mut prop = Propagator::new(cfg.clone(), Arc::clone(runtime), kernels.clone())?;
    prop.allocate_device_memory()?;

    // Profiling shot: long enough that the probe never finishes it.
    let shot = Shot {
        id: u32::MAX,
        propagation_time: f64::MAX,
        receivers: Vec::new(),
    };
    let mut state = prop.prepare(&shot)?;
    state.num_timesteps = i32::MAX;

    // Fill the pipeline.
    while prop.output_block().is_none() {
        prop.propagate_one_block(&mut state)?;
    }

    let cells_per_cycle = cfg.block_size_x() as f64
        * cfg.ny as f64
        * cfg.nz as f64
        * prop.steps_per_sweep() as f64;

    let mut best_tiles = z_tiles[0];
    let mut best_rate = 0.0f64;
    for &tiles in z_tiles {
        prop.set_z_tiles(tiles);
        let before = Instant::now();
        for _ in 0..probe_cycles {
            prop.propagate_one_block(&mut state)?;
        }
        let elapsed = before.elapsed().as_secs_f64().max(1e-9);
        let rate = cells_per_cycle * probe_cycles as f64 / (elapsed * 1e6);
        debug!(tiles, mcells_per_s = format!("{:.0}", rate), "tiling probed");
        if rate > best_rate {
            best_rate = rate;
            best_tiles = tiles;
        }
    }

    Ok(TuneCandidate {
        num_pipes: cfg.num_pipes,
        steps_per_device: cfg.steps_per_device,
        devices_per_pipe: cfg.device_ids.len() / cfg.num_pipes,
        z_tiles: best_tiles,
        mcells_per_s: best_rate,
    })
}

// ---------------------------------------------------------------------------
// Online Z-tile refinement
// ---------------------------------------------------------------------------

/// Refines the Z-tile count during a live run.
///
/// Cycles through the candidate set sampling one sweep per candidate;
/// after each full round the observed rates are sorted and the slower
/// half discarded. Converges to a single tiling after log2(n) rounds.
#[derive(Debug, Clone)]
pub struct ZTileTuner {
    /// (tile count, best observed rate) per surviving candidate.
    candidates: Vec<(usize, f64)>,
    cursor: usize,
}

impl ZTileTuner {
    pub fn new(candidates: &[usize]) -> Self {
        let candidates = if candidates.is_empty() {
            vec![(1usize, 0.0f64)]
        } else {
            candidates.iter().map(|&t| (t, 0.0)).collect()
        };
        ZTileTuner {
            candidates,
            cursor: 0,
        }
    }

    /// The tile count to use for the coming sweep.
    pub fn current(&self) -> usize {
        self.candidates[self.cursor].0
    }

    /// Whether refinement has converged to one candidate.
    pub fn settled(&self) -> bool {
        self.candidates.len() == 1
    }

    /// Record the rate observed for the current candidate and advance;
    /// at the end of a round, drop the slower half.
    pub fn record(&mut self, mcells_per_s: f64) {
        let entry = &mut self.candidates[self.cursor];
        entry.1 = entry.1.max(mcells_per_s);
        self.cursor += 1;
        if self.cursor >= self.candidates.len() {
            self.cursor = 0;
            if self.candidates.len() > 1 {
                bubble_sort_by_rate(&mut self.candidates);
                let keep = self.candidates.len().div_ceil(2);
                self.candidates.truncate(keep);
                debug!(
                    survivors = ?self.candidates.iter().map(|c| c.0).collect::<Vec<_>>(),
                    "z-tile refinement round"
                );
            }
        }
    }
}

/// Plain bubble sort, fastest rate first. The candidate set is tiny and
/// the order must be stable for ties (earlier tiling wins).
fn bubble_sort_by_rate(v: &mut [(usize, f64)]) {
    for i in 0..v.len() {
        for j in 0..v.len() - 1 - i {
            if v[j + 1].1 > v[j].1 {
                v.swap(j, j + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devices_per_pipe_budget() {
        // NbX = 32 → budget 30. One device, 3 steps: span 10.
        assert_eq!(devices_per_pipe(1, 3, 32), Some(1));
        // Three devices, 3 steps: span 26 fits; four would need 34.
        assert_eq!(devices_per_pipe(4, 3, 32), Some(3));
        // Tiny volume: nothing fits.
        assert_eq!(devices_per_pipe(1, 3, 8), None);
    }

    #[test]
    fn test_bubble_sort_orders_and_is_stable() {
        let mut v = vec![(1, 10.0), (2, 30.0), (3, 30.0), (4, 20.0)];
        bubble_sort_by_rate(&mut v);
        assert_eq!(v[0].0, 2); // ties keep their order
        assert_eq!(v[1].0, 3);
        assert_eq!(v[2].0, 4);
        assert_eq!(v[3].0, 1);
    }

    #[test]
    fn test_z_tile_tuner_halves_candidates() {
        let mut tuner = ZTileTuner::new(&[1, 2, 4, 8]);
        assert!(!tuner.settled());
        // First round: 2 and 4 are fast.
        for rate in [10.0, 40.0, 30.0, 5.0] {
            tuner.record(rate);
        }
        assert_eq!(tuner.candidates.len(), 2);
        assert_eq!(tuner.current(), 2);
        // Second round.
        tuner.record(35.0);
        tuner.record(50.0);
        assert!(tuner.settled());
        assert_eq!(tuner.current(), 4);
        // Settled tuner keeps accepting samples without changing.
        tuner.record(1.0);
        assert_eq!(tuner.current(), 4);
    }

    #[test]
    fn test_z_tile_tuner_empty_defaults_to_one() {
        let tuner = ZTileTuner::new(&[]);
        assert!(tuner.settled());
        assert_eq!(tuner.current(), 1);
    }
}
