//! Forward projection of the reconstruction into slice space
//!
//! Applies the sparse PSF operator to the current volume, producing per
//! slice the simulated image, the per-pixel PSF normaliser and the flag
//! marking pixels whose support touched the mask ROI. The residual used
//! by the super-resolution step is the scaled, bias-corrected slice minus
//! its simulation.

use rayon::prelude::*;

use crate::engine::Reconstruction;
use crate::image::Image;

impl Reconstruction {
    /// Forward-project the volume into every slice. A pixel whose PSF
    /// normaliser stays at or below 0.98 (support leaning out of the
    /// grid) simulates as 0.
    pub fn simulate_slices(&mut self) {
        let volume = &self.volume;
        let mask = &self.mask;
        self.slices.par_iter_mut().for_each(|rec| {
            rec.simulated = Image::zeros_like(&rec.image);
            rec.sim_weights = Image::zeros_like(&rec.image);
            rec.sim_inside = Image::zeros_like(&rec.image);

            let n = rec.image.len();
            for p in 0..n {
                if rec.image.data[p] > -0.01 {
                    let mut sim = 0.0;
                    let mut weight = 0.0;
                    for c in rec.coeffs.pixel(p) {
                        let (x, y, z) = (c.x as usize, c.y as usize, c.z as usize);
                        sim += c.value * volume.at(x, y, z);
                        weight += c.value;
                        if mask.at(x, y, z) == 1.0 {
                            rec.sim_inside.data[p] = 1.0;
                        }
                    }
                    rec.sim_weights.data[p] = weight;
                    rec.simulated.data[p] = if weight > 0.98 { sim / weight } else { 0.0 };
                }
            }
        });
    }

    /// Residual of every slice: scaled, bias-corrected intensities minus
    /// the simulation; padding pixels yield 0.
    pub fn slice_difference(&mut self) {
        self.slices.par_iter_mut().for_each(|rec| {
            rec.dif = rec.image.clone();
            for p in 0..rec.dif.len() {
                if rec.image.data[p] > -0.01 {
                    rec.dif.data[p] *= (-rec.bias.data[p]).exp() * rec.scale;
                    rec.dif.data[p] -= rec.simulated.data[p];
                } else {
                    rec.dif.data[p] = 0.0;
                }
            }
        });
    }

    /// Reassemble the forward-projected slices into stack-shaped volumes
    /// (one per input stack, grids taken from `stacks`). Slices excluded
    /// by the robust statistics simulate as zero planes.
    pub fn simulate_stacks(&self, stacks: &mut [Image]) {
        let volume = &self.volume;
        for stack in stacks.iter_mut() {
            stack.data.iter_mut().for_each(|v| *v = 0.0);
        }
        for rec in &self.slices {
            let (nx, ny, _) = rec.image.dims();
            let stack = &mut stacks[rec.stack];
            if rec.slice_weight > 0.5 {
                for j in 0..ny {
                    for i in 0..nx {
                        let p = rec.image.idx(i, j, 0);
                        if rec.image.data[p] > -0.01 {
                            let mut sim = 0.0;
                            let mut weight = 0.0;
                            for c in rec.coeffs.pixel(p) {
                                sim += c.value * volume.at(c.x as usize, c.y as usize, c.z as usize);
                                weight += c.value;
                            }
                            let value = if weight > 0.98 { sim / weight } else { 0.0 };
                            stack.set(i, j, rec.pos_in_stack, value);
                        }
                    }
                }
            }
        }
    }
}
