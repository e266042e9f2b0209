//! Per-slice intensity scale estimation
//!
//! The scale is the weighted least-squares match between the
//! bias-corrected slice and its simulation, restricted to pixels with a
//! nearly complete PSF normaliser.

use log::debug;
use rayon::prelude::*;

use crate::engine::Reconstruction;

impl Reconstruction {
    pub fn scale(&mut self) {
        self.slices.par_iter_mut().for_each(|rec| {
            let mut scalenum = 0.0;
            let mut scaleden = 0.0;
            for p in 0..rec.image.len() {
                if rec.image.data[p] > -0.01 && rec.sim_weights.data[p] > 0.99 {
                    let eb = (-rec.bias.data[p]).exp();
                    let corrected = rec.image.data[p] * eb;
                    scalenum += rec.weights.data[p] * corrected * rec.simulated.data[p];
                    scaleden += rec.weights.data[p] * corrected * corrected;
                }
            }
            rec.scale = if scaleden > 0.0 { scalenum / scaleden } else { 1.0 };
        });
        debug!(
            "slice scale = {:?}",
            self.slices.iter().map(|r| r.scale).collect::<Vec<_>>()
        );
    }
}
