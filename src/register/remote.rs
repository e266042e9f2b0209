//! Remote registration exchange
//!
//! Registration can be delegated to external workers through a shared
//! exchange directory: the engine writes the current reconstruction,
//! mask, per-slice images and initial transforms, hands off contiguous
//! strides of 32 slices to the worker callback (one wave per stride, to
//! bound the on-disk file count), and reads the refined transforms back.
//! A missing result file is fatal; the driver must guarantee exclusive
//! use of the directory.
//!
//! Layout: `current-source.nii.gz`, `current-mask.nii.gz` and, per slice
//! i, `res-slice-<i>.nii.gz` + `res-transformation-<i>.dof` in rigid mode
//! or `slice-<i>.nii.gz` + `transformation-<i>.dof` in free-form mode.

use std::path::Path;

use nalgebra::Matrix4;

use crate::engine::Reconstruction;
use crate::error::{ReconError, Result};
use crate::image::PADDING;
use crate::nifti_io::save_image_file;
use crate::transform::{FreeFormTransform, RigidTransform, SlicePose};
use crate::utils::resample_isotropic_padded;

use super::reset_origin;

/// Slices handed to a worker per wave.
const STRIDE: usize = 32;

impl Reconstruction {
    /// Run one remote registration round. `run_worker(start, stop)` is
    /// invoked for each slice stride after the inputs for that stride are
    /// on disk; it must leave the refined transform files in place.
    ///
    /// Slice images (and origin offsets in rigid mode) are rewritten only
    /// during the first three rounds; later rounds reuse them.
    pub fn remote_slice_to_volume_registration<W>(
        &mut self,
        iter: usize,
        exchange_dir: &Path,
        mut run_worker: W,
    ) -> Result<()>
    where
        W: FnMut(usize, usize) -> Result<()>,
    {
        save_image_file(&exchange_dir.join("current-source.nii.gz"), &self.volume)?;
        save_image_file(&exchange_dir.join("current-mask.nii.gz"), &self.mask)?;

        let resolution = self.volume.voxel_size().0;
        let ffd = self.params.ffd;

        if !ffd {
            if iter < 3 {
                self.offset_matrices.clear();
                for (index, rec) in self.slices.iter_mut().enumerate() {
                    let resampled = resample_isotropic_padded(&rec.image, resolution, PADDING);
                    let (target, offset) = reset_origin(&resampled);

                    let (tmin, tmax) = target.min_max();
                    rec.zero = !(tmax > 1.0 && tmax - tmin > 1.0);

                    save_image_file(
                        &exchange_dir.join(format!("res-slice-{}.nii.gz", index)),
                        &target,
                    )?;
                    self.offset_matrices.push(offset);
                }
            }

            for (index, rec) in self.slices.iter().enumerate() {
                let composed = RigidTransform::from_matrix(
                    rec.pose.rigid().matrix() * self.offset_matrices[index],
                );
                composed.write_dof(&exchange_dir.join(format!("res-transformation-{}.dof", index)))?;
            }

            let mut start = 0;
            while start < self.slices.len() {
                let stop = (start + STRIDE).min(self.slices.len());
                run_worker(start, stop)?;
                start = stop;
            }

            for (index, rec) in self.slices.iter_mut().enumerate() {
                let path = exchange_dir.join(format!("res-transformation-{}.dof", index));
                if !path.exists() {
                    return Err(ReconError::MissingExchangeFile(
                        path.display().to_string(),
                    ));
                }
                let refined = RigidTransform::read_dof(&path)?;
                let offset_inv = self.offset_matrices[index]
                    .try_inverse()
                    .unwrap_or_else(Matrix4::identity);
                rec.pose = SlicePose::Rigid(RigidTransform::from_matrix(
                    refined.matrix() * offset_inv,
                ));
            }
        } else {
            if iter < 3 {
                for (index, rec) in self.slices.iter_mut().enumerate() {
                    let target = resample_isotropic_padded(&rec.image, resolution, PADDING);
                    let (tmin, tmax) = target.min_max();
                    rec.zero = !(tmax > 1.0 && tmax - tmin > 1.0);

                    save_image_file(&exchange_dir.join(format!("slice-{}.nii.gz", index)), &target)?;
                    rec.pose
                        .write_dof(&exchange_dir.join(format!("transformation-{}.dof", index)))?;
                }
            }

            let mut start = 0;
            while start < self.slices.len() {
                let stop = (start + STRIDE).min(self.slices.len());
                run_worker(start, stop)?;
                start = stop;
            }

            for (index, rec) in self.slices.iter_mut().enumerate() {
                let path = exchange_dir.join(format!("transformation-{}.dof", index));
                if !path.exists() {
                    return Err(ReconError::MissingExchangeFile(
                        path.display().to_string(),
                    ));
                }
                rec.pose = SlicePose::FreeForm(FreeFormTransform::read_dof(&path)?);
            }
        }
        Ok(())
    }
}
