//! Separable 3-D lifting wavelet transform.
//!
//! The codec uses the CDF 9/7 biorthogonal wavelet in its lifting
//! factorization: two predict/update pairs plus a gain step per pass.
//! A level applies an X, then Y, then Z pass over the current low-pass
//! sub-cube, then halves each extent; levels repeat until every extent
//! reaches 1. The inverse replays levels smallest-first with Z, Y, X
//! passes that mirror the forward steps exactly, so reconstruction is
//! structurally guaranteed to within float rounding.
//!
//! # Fast vs reference path
//!
//! The lifting kernel operates on W interleaved lanes gathered into the
//! caller's scratch buffer — W adjacent X positions for the Y/Z passes,
//! W adjacent Y rows for the X pass. The fast path uses W = 4 (SSE2) or
//! W = 8 (AVX2); the reference path is the same kernel at W = 1. The
//! per-element operation order is identical in all three, and no FMA
//! contraction is used, so fast and reference output is bit-identical.
//! This equivalence is a first-class correctness property covered by the
//! tests at every supported block size.
//!
//! The transform is non-allocating: the scratch buffer holds at most
//! `max(bx, by, bz) * 8` floats ([`scratch_len`]).

use crate::simd::{Dispatcher, SimdLevel};

// CDF 9/7 lifting coefficients.
const A1: f32 = -1.586_134_34; // first predict
const A2: f32 = -0.052_980_118; // first update
const A3: f32 = 0.882_911_08; // second predict
const A4: f32 = 0.443_506_85; // second update
const K: f32 = 1.230_174_1; // low-pass gain
const INV_K: f32 = 1.0 / K;

/// Maximum number of levels: blocks cap at 256 = 2^8.
const MAX_LEVELS: usize = 8;

/// Scratch floats required for a block of the given extents.
pub fn scratch_len(bx: usize, by: usize, bz: usize) -> usize {
    bx.max(by).max(bz) * 8
}

/// Runtime-dispatched 3-D wavelet transform.
#[derive(Debug, Clone, Copy)]
pub struct Wavelet3d {
    level: SimdLevel,
    max_lanes: usize,
}

impl Wavelet3d {
    /// Probe CPU features and build a transform handle.
    pub fn new() -> Self {
        let level = Dispatcher::new().level();
        Wavelet3d {
            level,
            max_lanes: max_lanes_for(level),
        }
    }

    /// Forward transform in place. `data` holds a `bx*by*bz` block with x
    /// fastest, then y, then z; `tmp` needs [`scratch_len`] floats.
    pub fn forward(&self, data: &mut [f32], bx: usize, by: usize, bz: usize, tmp: &mut [f32]) {
        debug_assert!(data.len() >= bx * by * bz);
        debug_assert!(tmp.len() >= scratch_len(bx, by, bz));
        let (mut cx, mut cy, mut cz) = (bx, by, bz);
        while cx > 1 || cy > 1 || cz > 1 {
            self.level_forward(data, cx, cy, cz, bx, by, tmp);
            cx = half(cx);
            cy = half(cy);
            cz = half(cz);
        }
    }

    /// Inverse transform in place; exact mirror of [`Self::forward`].
    pub fn inverse(&self, data: &mut [f32], bx: usize, by: usize, bz: usize, tmp: &mut [f32]) {
        debug_assert!(data.len() >= bx * by * bz);
        debug_assert!(tmp.len() >= scratch_len(bx, by, bz));

        // Reconstruct the level dimension sequence without allocating.
        let mut dims = [(0usize, 0usize, 0usize); MAX_LEVELS];
        let mut n_levels = 0;
        let (mut cx, mut cy, mut cz) = (bx, by, bz);
        while cx > 1 || cy > 1 || cz > 1 {
            dims[n_levels] = (cx, cy, cz);
            n_levels += 1;
            cx = half(cx);
            cy = half(cy);
            cz = half(cz);
        }

        for &(cx, cy, cz) in dims[..n_levels].iter().rev() {
            self.level_inverse(data, cx, cy, cz, bx, by, tmp);
        }
    }

    fn level_forward(
        &self,
        data: &mut [f32],
        cx: usize,
        cy: usize,
        cz: usize,
        bx: usize,
        by: usize,
        tmp: &mut [f32],
    ) {
        if cx > 1 {
            self.pass_x(data, cx, cy, cz, bx, by, tmp, Direction::Forward);
        }
        if cy > 1 {
            self.pass_y(data, cx, cy, cz, bx, by, tmp, Direction::Forward);
        }
        if cz > 1 {
            self.pass_z(data, cx, cy, cz, bx, by, tmp, Direction::Forward);
        }
    }

    fn level_inverse(
        &self,
        data: &mut [f32],
        cx: usize,
        cy: usize,
        cz: usize,
        bx: usize,
        by: usize,
        tmp: &mut [f32],
    ) {
        if cz > 1 {
            self.pass_z(data, cx, cy, cz, bx, by, tmp, Direction::Inverse);
        }
        if cy > 1 {
            self.pass_y(data, cx, cy, cz, bx, by, tmp, Direction::Inverse);
        }
        if cx > 1 {
            self.pass_x(data, cx, cy, cz, bx, by, tmp, Direction::Inverse);
        }
    }

    /// X pass: lines are contiguous; lanes run across adjacent Y rows.
    #[allow(clippy::too_many_arguments)]
    fn pass_x(
        &self,
        data: &mut [f32],
        cx: usize,
        cy: usize,
        cz: usize,
        bx: usize,
        by: usize,
        tmp: &mut [f32],
        dir: Direction,
    ) {
        for iz in 0..cz {
            let plane = iz * bx * by;
            let mut iy = 0;
            while iy < cy {
                let w = self.max_lanes.min(cy - iy);
                let base = plane + iy * bx;
                self.lift_group(data, base, 1, bx, cx, w, tmp, dir);
                iy += w;
            }
        }
    }

    /// Y pass: element stride is one row; lanes run across adjacent X.
    #[allow(clippy::too_many_arguments)]
    fn pass_y(
        &self,
        data: &mut [f32],
        cx: usize,
        cy: usize,
        cz: usize,
        bx: usize,
        by: usize,
        tmp: &mut [f32],
        dir: Direction,
    ) {
        for iz in 0..cz {
            let plane = iz * bx * by;
            let mut ix = 0;
            while ix < cx {
                let w = self.max_lanes.min(cx - ix);
                let base = plane + ix;
                self.lift_group(data, base, bx, 1, cy, w, tmp, dir);
                ix += w;
            }
        }
    }

    /// Z pass: element stride is one XY plane; lanes run across adjacent X.
    #[allow(clippy::too_many_arguments)]
    fn pass_z(
        &self,
        data: &mut [f32],
        cx: usize,
        cy: usize,
        cz: usize,
        bx: usize,
        by: usize,
        tmp: &mut [f32],
        dir: Direction,
    ) {
        for iy in 0..cy {
            let row = iy * bx;
            let mut ix = 0;
            while ix < cx {
                let w = self.max_lanes.min(cx - ix);
                let base = row + ix;
                self.lift_group(data, base, bx * by, 1, cz, w, tmp, dir);
                ix += w;
            }
        }
    }

    /// Gather `w` strided lanes of length `n` into `tmp`, lift, scatter.
    ///
    /// Forward gathers even/odd interleaved samples and scatters the low
    /// half to positions `0..h` and the high half to `h..n`; inverse does
    /// the opposite.
    #[allow(clippy::too_many_arguments)]
    fn lift_group(
        &self,
        data: &mut [f32],
        base: usize,
        es: usize,
        ls: usize,
        n: usize,
        w: usize,
        tmp: &mut [f32],
        dir: Direction,
    ) {
        let h = n / 2;
        match dir {
            Direction::Forward => {
                for i in 0..h {
                    for l in 0..w {
                        tmp[i * w + l] = data[base + (2 * i) * es + l * ls];
                        tmp[(h + i) * w + l] = data[base + (2 * i + 1) * es + l * ls];
                    }
                }
                self.lift_forward(tmp, h, w);
                for i in 0..n {
                    for l in 0..w {
                        data[base + i * es + l * ls] = tmp[i * w + l];
                    }
                }
            }
            Direction::Inverse => {
                for i in 0..n {
                    for l in 0..w {
                        tmp[i * w + l] = data[base + i * es + l * ls];
                    }
                }
                self.lift_inverse(tmp, h, w);
                for i in 0..h {
                    for l in 0..w {
                        data[base + (2 * i) * es + l * ls] = tmp[i * w + l];
                        data[base + (2 * i + 1) * es + l * ls] = tmp[(h + i) * w + l];
                    }
                }
            }
        }
    }

    fn lift_forward(&self, tmp: &mut [f32], h: usize, w: usize) {
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 if w == 8 => {
                // SAFETY: level detection verified AVX2.
                unsafe { avx2::lift_forward_8(tmp, h) }
            }
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 | SimdLevel::Sse2 if w == 4 => {
                // SAFETY: SSE2 is always available on x86_64.
                unsafe { sse2::lift_forward_4(tmp, h) }
            }
            _ => scalar::lift_forward(tmp, h, w),
        }
    }

    fn lift_inverse(&self, tmp: &mut [f32], h: usize, w: usize) {
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 if w == 8 => {
                // SAFETY: level detection verified AVX2.
                unsafe { avx2::lift_inverse_8(tmp, h) }
            }
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 | SimdLevel::Sse2 if w == 4 => {
                // SAFETY: SSE2 is always available on x86_64.
                unsafe { sse2::lift_inverse_4(tmp, h) }
            }
            _ => scalar::lift_inverse(tmp, h, w),
        }
    }
}

impl Default for Wavelet3d {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Inverse,
}

fn half(c: usize) -> usize {
    if c > 1 {
        c / 2
    } else {
        1
    }
}

fn max_lanes_for(level: SimdLevel) -> usize {
    match level {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => 8,
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => 4,
        SimdLevel::Scalar => 1,
    }
}

/// Reference forward transform: the scalar kernel, one lane at a time.
pub fn forward_reference(data: &mut [f32], bx: usize, by: usize, bz: usize, tmp: &mut [f32]) {
    reference().forward(data, bx, by, bz, tmp)
}

/// Reference inverse transform: the scalar kernel, one lane at a time.
pub fn inverse_reference(data: &mut [f32], bx: usize, by: usize, bz: usize, tmp: &mut [f32]) {
    reference().inverse(data, bx, by, bz, tmp)
}

fn reference() -> Wavelet3d {
    Wavelet3d {
        level: SimdLevel::Scalar,
        max_lanes: 1,
    }
}

// ---------------------------------------------------------------------------
// Scalar kernel (reference semantics, arbitrary lane count)
// ---------------------------------------------------------------------------

mod scalar {
    use super::{A1, A2, A3, A4, INV_K, K};

    /// One forward lifting pass over `w` interleaved lanes.
    ///
    /// Layout: low half `s = tmp[0..h*w]`, high half `d = tmp[h*w..2*h*w]`,
    /// lane-major groups of `w`. Symmetric boundary extension clamps the
    /// neighbour index at both ends.
    pub fn lift_forward(tmp: &mut [f32], h: usize, w: usize) {
        let (s, d) = tmp.split_at_mut(h * w);
        for i in 0..h {
            let j = next(i, h);
            for l in 0..w {
                d[i * w + l] += A1 * (s[i * w + l] + s[j * w + l]);
            }
        }
        for i in 0..h {
            let j = prev(i);
            for l in 0..w {
                s[i * w + l] += A2 * (d[j * w + l] + d[i * w + l]);
            }
        }
        for i in 0..h {
            let j = next(i, h);
            for l in 0..w {
                d[i * w + l] += A3 * (s[i * w + l] + s[j * w + l]);
            }
        }
        for i in 0..h {
            let j = prev(i);
            for l in 0..w {
                s[i * w + l] += A4 * (d[j * w + l] + d[i * w + l]);
            }
        }
        for i in 0..h {
            for l in 0..w {
                s[i * w + l] *= INV_K;
                d[i * w + l] *= K;
            }
        }
    }

    /// Exact mirror of [`lift_forward`].
    pub fn lift_inverse(tmp: &mut [f32], h: usize, w: usize) {
        let (s, d) = tmp.split_at_mut(h * w);
        for i in 0..h {
            for l in 0..w {
                s[i * w + l] *= K;
                d[i * w + l] *= INV_K;
            }
        }
        for i in 0..h {
            let j = prev(i);
            for l in 0..w {
                s[i * w + l] -= A4 * (d[j * w + l] + d[i * w + l]);
            }
        }
        for i in 0..h {
            let j = next(i, h);
            for l in 0..w {
                d[i * w + l] -= A3 * (s[i * w + l] + s[j * w + l]);
            }
        }
        for i in 0..h {
            let j = prev(i);
            for l in 0..w {
                s[i * w + l] -= A2 * (d[j * w + l] + d[i * w + l]);
            }
        }
        for i in 0..h {
            let j = next(i, h);
            for l in 0..w {
                d[i * w + l] -= A1 * (s[i * w + l] + s[j * w + l]);
            }
        }
    }

    #[inline]
    pub fn next(i: usize, h: usize) -> usize {
        if i + 1 < h {
            i + 1
        } else {
            h - 1
        }
    }

    #[inline]
    pub fn prev(i: usize) -> usize {
        i.saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// x86_64 SSE2 kernel (4 lanes)
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use super::scalar::{next, prev};
    use super::{A1, A2, A3, A4, INV_K, K};
    use std::arch::x86_64::*;

    /// Apply one predict/update step to 4 lanes: `dst[i] += a*(x[i]+x[j])`.
    ///
    /// # Safety
    /// Requires SSE2; `dst` and `x` must each hold `h` groups of 4 floats.
    #[inline]
    unsafe fn step_4(dst: *mut f32, x: *const f32, h: usize, a: f32, use_next: bool) {
        let va = _mm_set1_ps(a);
        for i in 0..h {
            let j = if use_next { next(i, h) } else { prev(i) };
            let xi = _mm_loadu_ps(x.add(i * 4));
            let xj = _mm_loadu_ps(x.add(j * 4));
            let di = _mm_loadu_ps(dst.add(i * 4));
            let sum = _mm_add_ps(xi, xj);
            let r = _mm_add_ps(di, _mm_mul_ps(va, sum));
            _mm_storeu_ps(dst.add(i * 4), r);
        }
    }

    /// Forward lifting pass, 4 lanes. Bit-identical to the scalar kernel.
    ///
    /// # Safety
    /// Requires SSE2 (always available on x86_64); `tmp` holds `2*h`
    /// groups of 4 floats.
    #[target_feature(enable = "sse2")]
    pub unsafe fn lift_forward_4(tmp: &mut [f32], h: usize) {
        let (s, d) = tmp.split_at_mut(h * 4);
        let (s, d) = (s.as_mut_ptr(), d.as_mut_ptr());
        step_4(d, s, h, A1, true);
        step_4(s, d, h, A2, false);
        step_4(d, s, h, A3, true);
        step_4(s, d, h, A4, false);
        let vk = _mm_set1_ps(K);
        let vik = _mm_set1_ps(INV_K);
        for i in 0..h {
            let si = _mm_loadu_ps(s.add(i * 4));
            let di = _mm_loadu_ps(d.add(i * 4));
            _mm_storeu_ps(s.add(i * 4), _mm_mul_ps(si, vik));
            _mm_storeu_ps(d.add(i * 4), _mm_mul_ps(di, vk));
        }
    }

    /// `dst[i] -= a*(x[i]+x[j])`, 4 lanes.
    ///
    /// # Safety
    /// As [`step_4`].
    #[inline]
    unsafe fn unstep_4(dst: *mut f32, x: *const f32, h: usize, a: f32, use_next: bool) {
        let va = _mm_set1_ps(a);
        for i in 0..h {
            let j = if use_next { next(i, h) } else { prev(i) };
            let xi = _mm_loadu_ps(x.add(i * 4));
            let xj = _mm_loadu_ps(x.add(j * 4));
            let di = _mm_loadu_ps(dst.add(i * 4));
            let sum = _mm_add_ps(xi, xj);
            let r = _mm_sub_ps(di, _mm_mul_ps(va, sum));
            _mm_storeu_ps(dst.add(i * 4), r);
        }
    }

    /// Inverse lifting pass, 4 lanes.
    ///
    /// # Safety
    /// As [`lift_forward_4`].
    #[target_feature(enable = "sse2")]
    pub unsafe fn lift_inverse_4(tmp: &mut [f32], h: usize) {
        let (s, d) = tmp.split_at_mut(h * 4);
        let (s, d) = (s.as_mut_ptr(), d.as_mut_ptr());
        let vk = _mm_set1_ps(K);
        let vik = _mm_set1_ps(INV_K);
        for i in 0..h {
            let si = _mm_loadu_ps(s.add(i * 4));
            let di = _mm_loadu_ps(d.add(i * 4));
            _mm_storeu_ps(s.add(i * 4), _mm_mul_ps(si, vk));
            _mm_storeu_ps(d.add(i * 4), _mm_mul_ps(di, vik));
        }
        unstep_4(s, d, h, A4, false);
        unstep_4(d, s, h, A3, true);
        unstep_4(s, d, h, A2, false);
        unstep_4(d, s, h, A1, true);
    }
}

// ---------------------------------------------------------------------------
// x86_64 AVX2 kernel (8 lanes)
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::scalar::{next, prev};
    use super::{A1, A2, A3, A4, INV_K, K};
    use std::arch::x86_64::*;

    /// `dst[i] += a*(x[i]+x[j])`, 8 lanes. No FMA: rounding must match
    /// the scalar reference.
    ///
    /// # Safety
    /// Requires AVX2; `dst` and `x` must each hold `h` groups of 8 floats.
    #[inline]
    unsafe fn step_8(dst: *mut f32, x: *const f32, h: usize, a: f32, use_next: bool) {
        let va = _mm256_set1_ps(a);
        for i in 0..h {
            let j = if use_next { next(i, h) } else { prev(i) };
            let xi = _mm256_loadu_ps(x.add(i * 8));
            let xj = _mm256_loadu_ps(x.add(j * 8));
            let di = _mm256_loadu_ps(dst.add(i * 8));
            let sum = _mm256_add_ps(xi, xj);
            let r = _mm256_add_ps(di, _mm256_mul_ps(va, sum));
            _mm256_storeu_ps(dst.add(i * 8), r);
        }
    }

    /// Forward lifting pass, 8 lanes. Bit-identical to the scalar kernel.
    ///
    /// # Safety
    /// Requires AVX2; `tmp` holds `2*h` groups of 8 floats.
    #[target_feature(enable = "avx2")]
    pub unsafe fn lift_forward_8(tmp: &mut [f32], h: usize) {
        let (s, d) = tmp.split_at_mut(h * 8);
        let (s, d) = (s.as_mut_ptr(), d.as_mut_ptr());
        step_8(d, s, h, A1, true);
        step_8(s, d, h, A2, false);
        step_8(d, s, h, A3, true);
        step_8(s, d, h, A4, false);
        let vk = _mm256_set1_ps(K);
        let vik = _mm256_set1_ps(INV_K);
        for i in 0..h {
            let si = _mm256_loadu_ps(s.add(i * 8));
            let di = _mm256_loadu_ps(d.add(i * 8));
            _mm256_storeu_ps(s.add(i * 8), _mm256_mul_ps(si, vik));
            _mm256_storeu_ps(d.add(i * 8), _mm256_mul_ps(di, vk));
        }
    }

    /// `dst[i] -= a*(x[i]+x[j])`, 8 lanes.
    ///
    /// # Safety
    /// As [`step_8`].
    #[inline]
    unsafe fn unstep_8(dst: *mut f32, x: *const f32, h: usize, a: f32, use_next: bool) {
        let va = _mm256_set1_ps(a);
        for i in 0..h {
            let j = if use_next { next(i, h) } else { prev(i) };
            let xi = _mm256_loadu_ps(x.add(i * 8));
            let xj = _mm256_loadu_ps(x.add(j * 8));
            let di = _mm256_loadu_ps(dst.add(i * 8));
            let sum = _mm256_add_ps(xi, xj);
            let r = _mm256_sub_ps(di, _mm256_mul_ps(va, sum));
            _mm256_storeu_ps(dst.add(i * 8), r);
        }
    }

    /// Inverse lifting pass, 8 lanes.
    ///
    /// # Safety
    /// As [`lift_forward_8`].
    #[target_feature(enable = "avx2")]
    pub unsafe fn lift_inverse_8(tmp: &mut [f32], h: usize) {
        let (s, d) = tmp.split_at_mut(h * 8);
        let (s, d) = (s.as_mut_ptr(), d.as_mut_ptr());
        let vk = _mm256_set1_ps(K);
        let vik = _mm256_set1_ps(INV_K);
        for i in 0..h {
            let si = _mm256_loadu_ps(s.add(i * 8));
            let di = _mm256_loadu_ps(d.add(i * 8));
            _mm256_storeu_ps(s.add(i * 8), _mm256_mul_ps(si, vk));
            _mm256_storeu_ps(d.add(i * 8), _mm256_mul_ps(di, vik));
        }
        unstep_8(s, d, h, A4, false);
        unstep_8(d, s, h, A3, true);
        unstep_8(s, d, h, A2, false);
        unstep_8(d, s, h, A1, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_block(n: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }

    fn rms(data: &[f32]) -> f32 {
        let acc: f64 = data.iter().map(|&v| (v as f64) * (v as f64)).sum();
        (acc / data.len() as f64).sqrt() as f32
    }

    fn rms_diff(a: &[f32], b: &[f32]) -> f32 {
        let acc: f64 = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| {
                let d = (x - y) as f64;
                d * d
            })
            .sum();
        (acc / a.len() as f64).sqrt() as f32
    }

    const SIZES: &[(usize, usize, usize)] = &[
        (8, 8, 8),
        (16, 8, 8),
        (8, 16, 8),
        (8, 8, 16),
        (16, 16, 16),
        (32, 16, 8),
        (32, 32, 32),
        (64, 8, 8),
        (8, 64, 16),
    ];

    #[test]
    fn test_forward_fast_matches_reference_bitwise() {
        let xf = Wavelet3d::new();
        for &(bx, by, bz) in SIZES {
            let mut fast = random_block(bx * by * bz, 7);
            let mut slow = fast.clone();
            let mut tmp = vec![0.0f32; scratch_len(bx, by, bz)];
            xf.forward(&mut fast, bx, by, bz, &mut tmp);
            forward_reference(&mut slow, bx, by, bz, &mut tmp);
            assert_eq!(fast, slow, "{}x{}x{}", bx, by, bz);
        }
    }

    #[test]
    fn test_inverse_fast_matches_reference_bitwise() {
        let xf = Wavelet3d::new();
        for &(bx, by, bz) in SIZES {
            let mut fast = random_block(bx * by * bz, 11);
            let mut slow = fast.clone();
            let mut tmp = vec![0.0f32; scratch_len(bx, by, bz)];
            xf.inverse(&mut fast, bx, by, bz, &mut tmp);
            inverse_reference(&mut slow, bx, by, bz, &mut tmp);
            assert_eq!(fast, slow, "{}x{}x{}", bx, by, bz);
        }
    }

    #[test]
    fn test_round_trip_reconstructs() {
        let xf = Wavelet3d::new();
        for &(bx, by, bz) in SIZES {
            let orig = random_block(bx * by * bz, 23);
            let mut data = orig.clone();
            let mut tmp = vec![0.0f32; scratch_len(bx, by, bz)];
            xf.forward(&mut data, bx, by, bz, &mut tmp);
            xf.inverse(&mut data, bx, by, bz, &mut tmp);
            let rel = rms_diff(&orig, &data) / rms(&orig);
            assert!(rel < 1e-5, "{}x{}x{}: rel={}", bx, by, bz, rel);
        }
    }

    #[test]
    fn test_forward_concentrates_constant_into_dc() {
        // The gain step normalises the low band so a constant block
        // keeps its value in the DC coefficient; every detail
        // coefficient vanishes to rounding noise.
        let xf = Wavelet3d::new();
        let (bx, by, bz) = (16, 16, 16);
        let mut data = vec![1.0f32; bx * by * bz];
        let mut tmp = vec![0.0f32; scratch_len(bx, by, bz)];
        xf.forward(&mut data, bx, by, bz, &mut tmp);
        let dc = data[0];
        assert!((dc - 1.0).abs() < 1e-3, "dc = {}", dc);
        let tail_energy: f64 = data[1..]
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>();
        let total: f64 = tail_energy + (dc as f64) * (dc as f64);
        assert!(tail_energy / total < 1e-6, "tail share {}", tail_energy / total);
    }

    #[test]
    fn test_smallest_block() {
        let xf = Wavelet3d::new();
        let orig = random_block(8 * 8 * 8, 31);
        let mut data = orig.clone();
        let mut tmp = vec![0.0f32; scratch_len(8, 8, 8)];
        xf.forward(&mut data, 8, 8, 8, &mut tmp);
        assert_ne!(orig, data);
        xf.inverse(&mut data, 8, 8, 8, &mut tmp);
        let rel = rms_diff(&orig, &data) / rms(&orig);
        assert!(rel < 1e-5);
    }
}
