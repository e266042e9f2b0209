//! Per-slice bias field estimation
//!
//! The log-bias update is a weighted Gaussian smoothing of the log ratio
//! between the corrected slice and its simulation: the weighted residual
//! and the weight image are blurred with the same kernel and divided,
//! which normalises the field, and the result accumulates onto the
//! existing slice bias. The field is kept zero-mean over the slice ROI.

use rayon::prelude::*;

use crate::engine::Reconstruction;
use crate::image::Image;
use crate::utils::gaussian_blur;

impl Reconstruction {
    pub fn bias(&mut self) {
        let sigma_bias = self.params.sigma_bias;
        let cutoff = self.params.low_intensity_cutoff * self.max_intensity;

        self.slices.par_iter_mut().for_each(|rec| {
            let mut wresidual = Image::zeros_like(&rec.image);
            let mut wb = Image::zeros_like(&rec.image);

            for p in 0..rec.image.len() {
                if rec.image.data[p] > -0.01 && rec.sim_weights.data[p] > 0.99 {
                    let eb = (-rec.bias.data[p]).exp();
                    let corrected = rec.image.data[p] * eb * rec.scale;
                    // Both images must be comfortably positive for the
                    // log ratio to mean anything.
                    if corrected > cutoff && rec.simulated.data[p] > cutoff {
                        let weight = rec.weights.data[p] * corrected;
                        wb.data[p] = weight;
                        wresidual.data[p] = (corrected / rec.simulated.data[p]).ln() * weight;
                    }
                }
            }

            let wresidual = gaussian_blur(&wresidual, sigma_bias);
            let wb = gaussian_blur(&wb, sigma_bias);

            for p in 0..rec.image.len() {
                if rec.image.data[p] > -0.01 && wb.data[p] > 0.0 {
                    rec.bias.data[p] += wresidual.data[p] / wb.data[p];
                }
            }

            // Keep the slice bias zero-mean over the ROI.
            let mut sum = 0.0;
            let mut num = 0usize;
            for p in 0..rec.image.len() {
                if rec.image.data[p] > -0.01 {
                    sum += rec.bias.data[p];
                    num += 1;
                }
            }
            if num > 0 {
                let mean = sum / num as f64;
                for p in 0..rec.image.len() {
                    if rec.image.data[p] > -0.01 {
                        rec.bias.data[p] -= mean;
                    }
                }
            }
        });
    }
}
