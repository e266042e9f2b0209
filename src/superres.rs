//! Super-resolution volume update
//!
//! The initial estimate is a PSF-weighted deposition of the (bias- and
//! scale-corrected) slices normalised by the accumulated PSF mass. Every
//! inner iteration then back-projects the weighted residuals into an
//! addon image, applies it with the clamped step size and smooths the
//! result with the 13-direction edge-preserving regulariser. Bias
//! handling at the volume level (normalisation of the per-slice fields
//! and the optional self-referential correction) lives here as well.

use log::{info, warn};
use rayon::prelude::*;

use crate::engine::Reconstruction;
use crate::image::{Image, PADDING};
use crate::utils::gaussian_blur;

/// The 13 canonical half-space neighbour directions of the adaptive
/// regulariser.
const DIRECTIONS: [[i64; 3]; 13] = [
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 1, 0],
    [1, -1, 0],
    [1, 0, 1],
    [1, 0, -1],
    [0, 1, 1],
    [0, 1, -1],
    [1, 1, 1],
    [1, 1, -1],
    [1, -1, 1],
    [1, -1, -1],
];

impl Reconstruction {
    /// Build the initial volume estimate by Gaussian deposition of the
    /// corrected slices, and flag slices whose ROI overlap (pixels with
    /// any PSF mass) falls below a tenth of the median.
    pub fn gaussian_reconstruction(&mut self) {
        self.volume.data.iter_mut().for_each(|v| *v = 0.0);

        let mut overlap: Vec<(usize, usize)> = Vec::with_capacity(self.slices.len());
        for (index, rec) in self.slices.iter().enumerate() {
            if self.is_force_excluded(index) {
                continue;
            }
            let mut slice_vox_num = 0usize;
            for p in 0..rec.image.len() {
                if rec.image.data[p] > -0.01 {
                    let corrected =
                        rec.image.data[p] * (-rec.bias.data[p]).exp() * rec.scale;
                    let coeffs = rec.coeffs.pixel(p);
                    if !coeffs.is_empty() {
                        slice_vox_num += 1;
                    }
                    for c in coeffs {
                        let idx = self.volume.idx(c.x as usize, c.y as usize, c.z as usize);
                        self.volume.data[idx] += c.value * corrected;
                    }
                }
            }
            overlap.push((index, slice_vox_num));
        }

        // Normalise by the accumulated PSF mass per voxel.
        for (v, &w) in self.volume.data.iter_mut().zip(self.volume_weights.data.iter()) {
            if w > 0.0 {
                *v /= w;
            } else {
                *v = 0.0;
            }
        }

        // Exclude slices with too little ROI overlap.
        self.small_slices.clear();
        if !overlap.is_empty() {
            let mut counts: Vec<usize> = overlap.iter().map(|&(_, n)| n).collect();
            let mid = ((counts.len() as f64 * 0.5).round() as usize).saturating_sub(1);
            counts.select_nth_unstable(mid);
            let median = counts[mid];
            for &(index, n) in &overlap {
                if (n as f64) < 0.1 * median as f64 {
                    self.small_slices.push(index);
                }
            }
        }
        if !self.small_slices.is_empty() {
            info!("small slices: {:?}", self.small_slices);
        }
    }

    /// One super-resolution update: residual back-projection weighted by
    /// the voxel and slice posteriors (and the structural gate), the
    /// clamped gradient step, the intensity clamp and the adaptive
    /// regulariser. The optional volume-level bias correction runs last.
    pub fn superresolution(&mut self, iter: usize) {
        let original = self.volume.clone();

        self.slice_difference();

        let n = self.volume.len();
        let (vnx, vny, _) = self.volume.dims();
        let structural = self.params.structural_exclusion;
        let (addon, confidence) = self
            .slices
            .par_iter()
            .fold(
                || (vec![0.0; n], vec![0.0; n]),
                |(mut addon, mut confidence), rec| {
                    // The structural gate removes a slice entirely; a
                    // negative gate never subtracts signal.
                    let gate = if structural && rec.reg_weight < 0.0 { 0.0 } else { 1.0 };
                    let factor = rec.slice_weight * gate;
                    if factor > 0.0 {
                        for p in 0..rec.image.len() {
                            if rec.image.data[p] > -0.01 {
                                for c in rec.coeffs.pixel(p) {
                                    let idx = c.x as usize
                                        + c.y as usize * vnx
                                        + c.z as usize * vnx * vny;
                                    let w = c.value * rec.weights.data[p] * factor;
                                    addon[idx] += w * rec.dif.data[p];
                                    confidence[idx] += w;
                                }
                            }
                        }
                    }
                    (addon, confidence)
                },
            )
            .reduce(
                || (vec![0.0; n], vec![0.0; n]),
                |(mut a1, mut c1), (a2, c2)| {
                    for i in 0..n {
                        a1[i] += a2[i];
                        c1[i] += c2[i];
                    }
                    (a1, c1)
                },
            );

        let mut addon = addon;
        let mut confidence = confidence;
        if !self.params.adaptive_regularisation {
            for i in 0..n {
                if confidence[i] > 0.0 {
                    addon[i] /= confidence[i];
                    // Reverts the regulariser to its uniform form.
                    confidence[i] = 1.0;
                }
            }
        }
        self.confidence_map = Image::zeros_like(&self.volume);
        self.confidence_map.data = confidence;

        for i in 0..n {
            self.volume.data[i] += addon[i] * self.alpha;
        }

        // Bound the intensities.
        let lo = self.min_intensity * 0.9;
        let hi = self.max_intensity * 1.1;
        for v in self.volume.data.iter_mut() {
            if *v < lo {
                *v = lo;
            }
            if *v > hi {
                *v = hi;
            }
        }

        self.adaptive_regularization(iter, &original);

        if self.params.global_bias_correction {
            self.bias_correct_volume(&original);
        }
    }

    /// Edge-preserving anisotropic smoothing: per-direction diffusion
    /// weights computed on the pre-update volume, applied to the
    /// post-update volume over both direction signs, gated by the
    /// confidence map.
    pub fn adaptive_regularization(&mut self, _iter: usize, original: &Image) {
        let factor: Vec<f64> = DIRECTIONS
            .iter()
            .map(|d| 1.0 / d.iter().map(|c| c.abs() as f64).sum::<f64>())
            .collect();

        let (nx, ny, nz) = self.volume.dims();
        let delta = self.delta;
        let confidence = &self.confidence_map;

        // Diffusion weights from the pre-update volume.
        let mut b: Vec<Vec<f64>> = Vec::with_capacity(13);
        for (di, d) in DIRECTIONS.iter().enumerate() {
            let weights: Vec<f64> = (0..self.volume.len())
                .into_par_iter()
                .map(|idx| {
                    let i = (idx % nx) as i64;
                    let j = ((idx / nx) % ny) as i64;
                    let k = (idx / (nx * ny)) as i64;
                    let (ii, jj, kk) = (i + d[0], j + d[1], k + d[2]);
                    if original.contains(ii, jj, kk) {
                        let diff = (original.at(ii as usize, jj as usize, kk as usize)
                            - original.at(i as usize, j as usize, k as usize))
                            / delta;
                        factor[di] / (1.0 + diff * diff)
                    } else {
                        0.0
                    }
                })
                .collect();
            b.push(weights);
        }

        let current = self.volume.clone();
        let scale = self.alpha * self.lambda / (delta * delta);
        let updated: Vec<f64> = (0..current.len())
            .into_par_iter()
            .map(|idx| {
                if confidence.data[idx] <= 0.0 {
                    return current.data[idx];
                }
                let i = (idx % nx) as i64;
                let j = ((idx / nx) % ny) as i64;
                let k = (idx / (nx * ny)) as i64;
                let mut val = 0.0;
                let mut sum = 0.0;
                for (di, d) in DIRECTIONS.iter().enumerate() {
                    let (ii, jj, kk) = (i + d[0], j + d[1], k + d[2]);
                    if current.contains(ii, jj, kk) {
                        let nidx = ii as usize + jj as usize * nx + kk as usize * nx * ny;
                        if confidence.data[nidx] > 0.0 {
                            val += b[di][idx] * current.data[nidx];
                            sum += b[di][idx];
                        }
                    }
                    let (ii, jj, kk) = (i - d[0], j - d[1], k - d[2]);
                    if current.contains(ii, jj, kk) {
                        let nidx = ii as usize + jj as usize * nx + kk as usize * nx * ny;
                        if confidence.data[nidx] > 0.0 {
                            val += b[di][nidx] * current.data[nidx];
                            sum += b[di][nidx];
                        }
                    }
                }
                val -= sum * current.data[idx];
                current.data[idx] + scale * val
            })
            .collect();
        self.volume.data = updated;

        if self.alpha * self.lambda / (delta * delta) > 0.068 {
            warn!(
                "regularization might not have smoothing effect! ensure that \
                 alpha*lambda/delta^2 is below 0.068"
            );
        }
    }

    /// Remove the low-frequency component the slice bias fields may have
    /// pushed into the volume: the smoothed log ratio against the
    /// pre-update volume is divided out inside the mask.
    pub fn bias_correct_volume(&mut self, original: &Image) {
        let cutoff = self.params.low_intensity_cutoff * self.max_intensity;

        let mut residual = self.volume.clone();
        let mut weights = self.mask.clone();
        for i in 0..residual.len() {
            if weights.data[i] == 1.0 && original.data[i] > cutoff && residual.data[i] > cutoff {
                residual.data[i] = (residual.data[i] / original.data[i]).ln();
            } else {
                residual.data[i] = 0.0;
                weights.data[i] = 0.0;
            }
        }

        let residual = gaussian_blur(&residual, self.params.sigma_bias);
        let weights = gaussian_blur(&weights, self.params.sigma_bias);

        let lo = self.min_intensity * 0.9;
        let hi = self.max_intensity * 1.1;
        for i in 0..self.volume.len() {
            if self.mask.data[i] == 1.0 && weights.data[i] > 0.0 {
                let field = (residual.data[i] / weights.data[i]).exp();
                self.volume.data[i] /= field;
                if self.volume.data[i] < lo {
                    self.volume.data[i] = lo;
                }
                if self.volume.data[i] > hi {
                    self.volume.data[i] = hi;
                }
            }
        }
    }

    /// Deposit the per-slice log-bias fields (with the scale folded in)
    /// into volume space, normalise by the volume weights and a blurred
    /// mask, and divide the result out of the reconstruction.
    pub fn normalise_bias(&mut self, _iter: usize) {
        let n = self.volume.len();
        let (vnx, vny, _) = self.volume.dims();
        let bias_acc = self
            .slices
            .par_iter()
            .fold(
                || vec![0.0; n],
                |mut acc, rec| {
                    let log_scale = if rec.scale > 0.0 { rec.scale.ln() } else { 0.0 };
                    for p in 0..rec.image.len() {
                        if rec.image.data[p] > -0.01 {
                            let b = rec.bias.data[p] - log_scale;
                            for c in rec.coeffs.pixel(p) {
                                acc[c.x as usize + c.y as usize * vnx
                                    + c.z as usize * vnx * vny] += c.value * b;
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0; n],
                |mut a, b| {
                    for i in 0..n {
                        a[i] += b[i];
                    }
                    a
                },
            );

        let mut bias = Image::zeros_like(&self.volume);
        bias.data = bias_acc;
        for (b, &w) in bias.data.iter_mut().zip(self.volume_weights.data.iter()) {
            if w > 0.0 {
                *b /= w;
            } else {
                *b = 0.0;
            }
        }
        for (b, &m) in bias.data.iter_mut().zip(self.mask.data.iter()) {
            if m == 0.0 {
                *b = 0.0;
            }
        }

        let blurred = gaussian_blur(&bias, self.params.sigma_bias);
        let mask_blurred = gaussian_blur(&self.mask, self.params.sigma_bias);
        for i in 0..n {
            let normaliser = mask_blurred.data[i];
            let field = if normaliser > 0.0 {
                blurred.data[i] / normaliser
            } else {
                0.0
            };
            if self.volume.data[i] != PADDING {
                self.volume.data[i] /= (-field).exp();
            }
        }
    }
}
