//! Slice-to-volume registration
//!
//! Every slice is aligned independently against the current
//! reconstruction, all slices in parallel. Before the search the slice
//! grid is rebased so its centre sits at the world origin and the offset
//! is folded into the initial pose; the optimiser is far less sensitive
//! to rotations that way, and the offset is undone afterwards. Slices
//! with a degenerate intensity range are skipped.
//!
//! The structural gate re-checks each slice after registration: the
//! blurred slice is compared by masked NCC against the reconstruction
//! resampled into its grid, and slices under the threshold are flagged
//! out of the super-resolution sums.

pub mod metric;
pub mod optimizer;
pub mod remote;

pub use metric::pose_similarity;
pub use optimizer::{optimise_ffd, optimise_rigid, SearchSettings};

use log::info;
use nalgebra::{Matrix4, Vector3};
use rayon::prelude::*;

use crate::engine::Reconstruction;
use crate::image::{Image, PADDING};
use crate::quality::compute_ncc;
use crate::transform::{RigidTransform, SlicePose};
use crate::utils::{gaussian_blur_with_padding, resample_fill};

/// Rebase an image so its centre lands on the world origin; returns the
/// rebased copy and the offset translation that was removed.
pub(crate) fn reset_origin(image: &Image) -> (Image, Matrix4<f64>) {
    let centre = image.centre_world();
    let offset = Matrix4::new_translation(&Vector3::new(centre[0], centre[1], centre[2]));
    let shift = Matrix4::new_translation(&Vector3::new(-centre[0], -centre[1], -centre[2]));
    let mut rebased = image.clone();
    rebased.set_affine(shift * image.affine_matrix());
    (rebased, offset)
}

impl Reconstruction {
    /// Re-estimate every slice pose against the current reconstruction.
    pub fn register_slices_to_volume(&mut self) {
        let volume = self.volume.clone();
        let settings = SearchSettings::default();

        self.slices.par_iter_mut().for_each(|rec| {
            if rec.zero {
                return;
            }
            let (rebased, offset) = reset_origin(&rec.image);
            let offset_inv = offset.try_inverse().unwrap_or_else(Matrix4::identity);

            match &mut rec.pose {
                SlicePose::Rigid(r) => {
                    let init = RigidTransform::from_matrix(r.matrix() * offset);
                    let found = optimise_rigid(&rebased, &volume, init, &settings);
                    *r = RigidTransform::from_matrix(found.matrix() * offset_inv);
                }
                SlicePose::FreeForm(f) => {
                    // Rigid part first on the rebased grid, then control
                    // point refinement on the original geometry.
                    let init = RigidTransform::from_matrix(f.rigid().matrix() * offset);
                    let found = optimise_rigid(&rebased, &volume, init, &settings);
                    f.set_rigid(RigidTransform::from_matrix(found.matrix() * offset_inv));
                    *f = optimise_ffd(&rec.image, &volume, f.clone(), &settings);
                }
            }
        });
    }

    /// NCC gate against the forward-resampled reconstruction: slices
    /// scoring at or below the threshold get a negative registration
    /// weight and drop out of the super-resolution sums.
    pub fn structural_exclusion(&mut self) {
        let (smin, _) = self.volume.min_max();
        let source_padding = if smin < -0.1 {
            PADDING
        } else if smin < 0.1 {
            0.0
        } else {
            PADDING
        };

        let volume = &self.volume;
        let mask = &self.mask;
        let threshold = self.params.global_ncc_threshold;

        let nccs: Vec<f64> = self
            .slices
            .par_iter_mut()
            .map(|rec| {
                // Reconstruction sampled onto the slice grid.
                let mut output = Image::zeros_like(&rec.image);
                resample_fill(volume, &mut output, |w| rec.pose.transform_point(w), false, source_padding);

                // The slice itself, lightly blurred.
                let mut target =
                    gaussian_blur_with_padding(&rec.image, 0.6 * rec.image.voxel_size().0, source_padding);

                // Mask both on the slice grid.
                let mut slice_mask = Image::zeros_like(&rec.image);
                resample_fill(mask, &mut slice_mask, |w| rec.pose.transform_point(w), true, 0.0);
                for p in 0..target.len() {
                    target.data[p] *= slice_mask.data[p];
                    output.data[p] *= slice_mask.data[p];
                }

                let mut ncc = compute_ncc(&target, &output, 0.0, None);
                if ncc == -1.0 {
                    // Too little overlap to judge; give the benefit of
                    // the doubt.
                    ncc = 1.0;
                }
                rec.reg_weight = if ncc >= threshold { 1.0 } else { -1.0 };
                ncc
            })
            .collect();

        let mean_ncc = nccs.iter().sum::<f64>() / nccs.len().max(1) as f64;
        let excluded: Vec<usize> = self
            .slices
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.reg_weight < 0.0)
            .map(|(i, _)| i)
            .collect();
        info!(
            "structural exclusion: mean registration ncc {:.4}, excluded {:?}",
            mean_ncc, excluded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReconParams, Reconstruction};
    use crate::transform::RigidTransform;

    fn blob_stack(n: usize) -> Image {
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let mut img = Image::new((n, n, n), (1.0, 1.0, 1.0), &affine);
        let c = (n as f64 - 1.0) / 2.0;
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let r2 = (i as f64 - c).powi(2)
                        + 0.6 * (j as f64 - c).powi(2)
                        + 0.3 * (k as f64 - c).powi(2);
                    img.set(i, j, k, 150.0 * (-r2 / 20.0).exp());
                }
            }
        }
        img
    }

    #[test]
    fn test_reset_origin_roundtrip() {
        let stack = blob_stack(8);
        let slice = stack.extract_slice(4, 1.0);
        let (rebased, offset) = reset_origin(&slice);
        let centre = rebased.centre_world();
        for c in centre {
            assert!(c.abs() < 1e-9, "rebased centre should be at origin, got {:?}", centre);
        }
        // Undoing the offset restores the original mapping.
        let p = rebased.image_to_world([1.0, 2.0, 0.0]);
        let q = offset * nalgebra::Vector4::new(p[0], p[1], p[2], 1.0);
        let orig = slice.image_to_world([1.0, 2.0, 0.0]);
        for (a, b) in [q[0], q[1], q[2]].iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_structural_exclusion_zero_threshold_passes_everything() {
        let stack = blob_stack(12);
        let mut params = ReconParams::default();
        params.global_ncc_threshold = 0.0;
        params.structural_exclusion = true;
        let mut recon = Reconstruction::new(params);
        recon.create_template_aniso(&stack).unwrap();
        recon.set_mask(None, 0.0, 0.5).unwrap();
        recon
            .create_slices(&[stack], &[RigidTransform::identity()], &[1.0], None, None)
            .unwrap();
        recon.structural_exclusion();
        for (i, rec) in recon.slices.iter().enumerate() {
            assert_eq!(rec.reg_weight, 1.0, "slice {} should pass the zero threshold", i);
        }
    }
}
