//! Voxel- and slice-level E-step
//!
//! Voxel posteriors come from a Gaussian-inlier / uniform-outlier
//! mixture on the residual. Each slice is then summarised by its
//! potential, the root mean square of (1 - w) over in-ROI pixels, and a
//! two-Gaussian mixture on the potentials yields the slice posteriors.
//! Potentials are pinned to -1 (and posteriors to 0) for force-excluded
//! slices, slices with too little ROI overlap and slices whose intensity
//! scale left the plausible range.

use log::{debug, info, warn};
use rayon::prelude::*;

use super::gaussian;
use crate::engine::Reconstruction;

impl Reconstruction {
    pub fn e_step(&mut self) {
        let sigma = self.sigma;
        let mix = self.mix;
        let m_density = self.m;

        // Voxel-level posteriors and slice potentials.
        self.slices.par_iter_mut().for_each(|rec| {
            let mut potential = 0.0;
            let mut num = 0usize;
            for p in 0..rec.image.len() {
                rec.weights.data[p] = 0.0;
                if rec.image.data[p] > -0.01 {
                    if rec.sim_weights.data[p] > 0.0 {
                        let corrected =
                            rec.image.data[p] * (-rec.bias.data[p]).exp() * rec.scale;
                        let e = corrected - rec.simulated.data[p];
                        let g = gaussian(e, sigma);
                        let weight = g * mix / (g * mix + m_density * (1.0 - mix));
                        rec.weights.data[p] = weight;
                        if rec.sim_weights.data[p] > 0.99 {
                            potential += (1.0 - weight) * (1.0 - weight);
                            num += 1;
                        }
                    }
                }
            }
            rec.potential = if num > 0 {
                (potential / num as f64).sqrt()
            } else {
                -1.0
            };
        });

        // Pin potentials of slices that cannot vote.
        for &i in &self.params.force_excluded {
            if i < self.slices.len() {
                self.slices[i].potential = -1.0;
            }
        }
        let small = self.small_slices.clone();
        for i in small {
            self.slices[i].potential = -1.0;
        }
        for rec in self.slices.iter_mut() {
            // Unrealistic scales point at misregistration.
            if rec.scale < 0.2 || rec.scale > 5.0 {
                rec.potential = -1.0;
            }
        }
        debug!(
            "slice potentials: {:?}",
            self.slices.iter().map(|r| r.potential).collect::<Vec<_>>()
        );

        // Means of the inlier and outlier potentials under the current
        // posteriors; min and max seed the means when a class is empty.
        let mut sum = 0.0;
        let mut den = 0.0;
        let mut sum2 = 0.0;
        let mut den2 = 0.0;
        let mut maxs = 0.0f64;
        let mut mins = 1.0f64;
        for rec in &self.slices {
            if rec.potential >= 0.0 {
                sum += rec.potential * rec.slice_weight;
                den += rec.slice_weight;
                sum2 += rec.potential * (1.0 - rec.slice_weight);
                den2 += 1.0 - rec.slice_weight;
                maxs = maxs.max(rec.potential);
                mins = mins.min(rec.potential);
            }
        }
        self.mean_s = if den > 0.0 { sum / den } else { mins };
        self.mean_s2 = if den2 > 0.0 {
            sum2 / den2
        } else {
            (maxs + self.mean_s) / 2.0
        };

        // Variances of the two classes.
        let mut sum = 0.0;
        let mut den = 0.0;
        let mut sum2 = 0.0;
        let mut den2 = 0.0;
        for rec in &self.slices {
            if rec.potential >= 0.0 {
                sum += (rec.potential - self.mean_s).powi(2) * rec.slice_weight;
                den += rec.slice_weight;
                sum2 += (rec.potential - self.mean_s2).powi(2) * (1.0 - rec.slice_weight);
                den2 += 1.0 - rec.slice_weight;
            }
        }
        let floor = self.params.step * self.params.step / 6.28;
        if sum > 0.0 && den > 0.0 {
            self.sigma_s = (sum / den).max(floor);
        } else {
            self.sigma_s = 0.025;
            if sum <= 0.0 {
                warn!("all slices are equal, setting sigma_s to {}", self.sigma_s.sqrt());
            }
        }
        if sum2 > 0.0 && den2 > 0.0 {
            self.sigma_s2 = (sum2 / den2).max(floor);
        } else {
            self.sigma_s2 = ((self.mean_s2 - self.mean_s).powi(2) / 4.0).max(floor);
            warn!("all slices are inliers, setting sigma_s2 to {}", self.sigma_s2.sqrt());
        }

        // Slice posteriors from the two-component mixture, with the
        // deterministic fallbacks when the densities degenerate.
        let (mean_s, mean_s2) = (self.mean_s, self.mean_s2);
        let (sigma_s, sigma_s2) = (self.sigma_s, self.sigma_s2);
        let mix_s = self.mix_s;
        let den_valid = den;
        self.slices.par_iter_mut().for_each(|rec| {
            if rec.potential == -1.0 {
                rec.slice_weight = 0.0;
                return;
            }
            if den_valid <= 0.0 || mean_s2 <= mean_s {
                rec.slice_weight = 1.0;
                return;
            }
            let gs1 = if rec.potential < mean_s2 {
                gaussian(rec.potential - mean_s, sigma_s)
            } else {
                0.0
            };
            let gs2 = if rec.potential > mean_s {
                gaussian(rec.potential - mean_s2, sigma_s2)
            } else {
                0.0
            };
            let likelihood = gs1 * mix_s + gs2 * (1.0 - mix_s);
            if likelihood > 0.0 {
                rec.slice_weight = gs1 * mix_s / likelihood;
            } else if rec.potential <= mean_s {
                rec.slice_weight = 1.0;
            } else if rec.potential >= mean_s2 {
                rec.slice_weight = 0.0;
            } else {
                rec.slice_weight = 1.0;
            }
        });

        // Slice-level mixing proportion.
        let mut sum = 0.0;
        let mut num = 0usize;
        for rec in &self.slices {
            if rec.potential >= 0.0 {
                sum += rec.slice_weight;
                num += 1;
            }
        }
        if num > 0 {
            self.mix_s = sum / num as f64;
        } else {
            warn!("all slices are outliers, setting mix_s to 0.9");
            self.mix_s = 0.9;
        }

        info!(
            "slice robust statistics: means {:.4} {:.4}, sigmas {:.4} {:.4}, proportions {:.3} {:.3}",
            self.mean_s,
            self.mean_s2,
            self.sigma_s.sqrt(),
            self.sigma_s2.sqrt(),
            self.mix_s,
            1.0 - self.mix_s
        );
        debug!(
            "slice weights: {:?}",
            self.slices.iter().map(|r| r.slice_weight).collect::<Vec<_>>()
        );
    }
}
