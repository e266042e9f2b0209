//! Expectation-Maximisation robust statistics
//!
//! Voxel- and slice-level outlier rejection, per-slice intensity scaling
//! and per-slice bias estimation. The model is a two-component mixture at
//! both levels: Gaussian inliers against a uniform voxel outlier density
//! and a second Gaussian for slice outliers.
//!
//! - `estep`: voxel posteriors, slice potentials and slice posteriors
//! - `mstep`: voxel-level noise variance, mixing proportion and uniform
//!   density update
//! - `scale`: per-slice intensity scale
//! - `bias`: per-slice log-bias field from weighted residual smoothing

pub mod bias;
pub mod estep;
pub mod mstep;
pub mod scale;

use log::info;
use rayon::prelude::*;

use crate::engine::Reconstruction;

/// Gaussian density with variance `s`; 6.28 stands in for 2*pi, and the
/// sigma floors are expressed against the same constant.
#[inline]
pub(crate) fn gaussian(x: f64, s: f64) -> f64 {
    (-x * x / (2.0 * s)).exp() / (6.28 * s).sqrt()
}

impl Reconstruction {
    /// Find the intensity range over all slices (padding excluded). Run
    /// once after slice creation.
    pub fn initialize_em(&mut self) {
        let (lo, hi) = self
            .slices
            .par_iter()
            .map(|rec| {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &v in &rec.image.data {
                    if v > 0.0 {
                        if v < lo {
                            lo = v;
                        }
                        if v > hi {
                            hi = v;
                        }
                    }
                }
                (lo, hi)
            })
            .reduce(
                || (f64::INFINITY, f64::NEG_INFINITY),
                |(alo, ahi), (blo, bhi)| (alo.min(blo), ahi.max(bhi)),
            );
        self.min_intensity = lo;
        self.max_intensity = hi;
    }

    /// Reset per-slice EM state: voxel weights one inside / zero on
    /// padding, zero bias, unit scale and unit slice weight. Slices on
    /// the force-excluded list are pinned to zero weight.
    pub fn initialize_em_values(&mut self) {
        self.slices.par_iter_mut().for_each(|rec| {
            for p in 0..rec.image.len() {
                rec.weights.data[p] = if rec.image.data[p] > -0.01 { 1.0 } else { 0.0 };
                rec.bias.data[p] = 0.0;
            }
            rec.slice_weight = 1.0;
            rec.scale = 1.0;
        });
        for &i in &self.params.force_excluded {
            if i < self.slices.len() {
                self.slices[i].slice_weight = 0.0;
            }
        }
    }

    /// Seed the EM parameters: the voxel noise variance from the current
    /// residuals, literature starting values for the slice-level mixture
    /// and the uniform outlier density from the intensity range.
    pub fn initialize_robust_statistics(&mut self) {
        let (sigma_sum, num) = self
            .slices
            .par_iter()
            .map(|rec| {
                let mut sum = 0.0;
                let mut n = 0usize;
                for p in 0..rec.image.len() {
                    if rec.image.data[p] > -0.01
                        && rec.sim_inside.data[p] == 1.0
                        && rec.sim_weights.data[p] > 0.99
                    {
                        let e = rec.image.data[p] - rec.simulated.data[p];
                        sum += e * e;
                        n += 1;
                    }
                }
                (sum, n)
            })
            .reduce(|| (0.0, 0), |(a, b), (c, d)| (a + c, b + d));

        // Slices with no ROI overlap cannot vote.
        for rec in self.slices.iter_mut() {
            if !rec.inside {
                rec.slice_weight = 0.0;
            }
        }
        for &i in &self.params.force_excluded {
            if i < self.slices.len() {
                self.slices[i].slice_weight = 0.0;
            }
        }

        self.sigma = if num > 0 { sigma_sum / num as f64 } else { 0.0 };
        self.sigma_s = 0.025;
        self.mix = 0.9;
        self.mix_s = 0.9;
        self.m = 1.0 / (2.1 * self.max_intensity - 1.9 * self.min_intensity);

        info!(
            "initializing robust statistics: sigma={:.4} m={:.6} mix={} mix_s={}",
            self.sigma.sqrt(),
            self.m,
            self.mix,
            self.mix_s
        );
    }
}
