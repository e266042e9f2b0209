//! Voxel-level M-step
//!
//! Updates the inlier noise variance as the posterior-weighted mean of
//! squared residuals, the mixing proportion as the mean posterior and
//! the uniform outlier density from the range of residual-corrected
//! intensities encountered.

use log::{info, warn};
use rayon::prelude::*;

use crate::engine::Reconstruction;

impl Reconstruction {
    pub fn m_step(&mut self, iter: usize) {
        let (sigma, mix, num, min_s, max_s) = self
            .slices
            .par_iter()
            .map(|rec| {
                let mut sigma = 0.0;
                let mut mix = 0.0;
                let mut num = 0usize;
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for p in 0..rec.image.len() {
                    if rec.image.data[p] > -0.01 && rec.sim_weights.data[p] > 0.99 {
                        let s = rec.image.data[p] * (-rec.bias.data[p]).exp() * rec.scale;
                        let e = s - rec.simulated.data[p];
                        sigma += rec.weights.data[p] * e * e;
                        mix += rec.weights.data[p];
                        num += 1;
                        if s < lo {
                            lo = s;
                        }
                        if s > hi {
                            hi = s;
                        }
                    }
                }
                (sigma, mix, num, lo, hi)
            })
            .reduce(
                || (0.0, 0.0, 0usize, f64::INFINITY, f64::NEG_INFINITY),
                |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3.min(b.3), a.4.max(b.4)),
            );

        if mix > 0.0 {
            self.sigma = sigma / mix;
        } else {
            // Keep the previous variance; a single degenerate step must
            // not abort the solve.
            warn!("degenerate M-step: sigma={} mix={}", sigma, mix);
        }
        let floor = self.params.step * self.params.step / 6.28;
        if self.sigma < floor {
            self.sigma = floor;
        }
        if iter > 1 && num > 0 {
            self.mix = mix / num as f64;
        }
        if max_s > min_s {
            self.m = 1.0 / (max_s - min_s);
        }

        info!(
            "voxel-wise robust statistics: sigma={:.4} mix={:.4} m={:.6}",
            self.sigma.sqrt(),
            self.mix,
            self.m
        );
    }
}
