//! Reconstruction engine state and outer iterator
//!
//! The engine is one explicit context struct threaded through the stage
//! functions spread over the algorithm modules: registration
//! (`register`), forward projection (`simulate`), robust statistics
//! (`em`) and the super-resolution update (`superres`). There are no
//! process-wide singletons; everything a stage touches lives here.
//!
//! Per-slice state is grouped into one record per slice so that the
//! bulk-synchronous stages can run as a rayon parallel-for over records,
//! each slice owning its own arrays for the duration of a stage. Volume-
//! sized accumulations are explicit fold/reduce reductions, except the
//! coefficient deposition, which stays serial.

use std::fmt::Write as _;
use std::path::Path;

use log::{info, warn};
use rayon::prelude::*;

use crate::error::{ReconError, Result};
use crate::image::{Image, PADDING};
use crate::psf::{compute_slice_coefficients, SliceCoeffs};
use crate::quality::{compute_ncc, slice_nrmse, QualityReport};
use crate::transform::{RigidTransform, SlicePose};
use crate::utils::{enlarge_z, gaussian_blur, gaussian_blur_with_padding, resample_fill,
                   resample_isotropic_padded, sample_nearest};

/// Engine tunables with fetal-MRI defaults.
#[derive(Debug, Clone)]
pub struct ReconParams {
    /// Isotropic output resolution in mm; 0 derives it from the template
    /// stack voxel sizes.
    pub resolution: f64,
    /// Edge-preservation parameter of the adaptive regulariser.
    pub delta: f64,
    /// Regularisation strength (before the internal delta^2 scaling).
    pub lambda: f64,
    /// FWHM-derived sigma (mm) of the bias-smoothing kernel.
    pub sigma_bias: f64,
    /// NCC threshold of the structural outlier gate.
    pub global_ncc_threshold: f64,
    /// Outer iterations (motion correction rounds).
    pub outer_iterations: usize,
    /// Inner super-resolution iterations per outer round.
    pub sr_iterations: usize,
    /// Estimate per-slice intensity scales.
    pub intensity_matching: bool,
    /// Estimate per-slice bias fields.
    pub bias_correction: bool,
    /// Remove residual low-frequency bias from the volume itself.
    pub global_bias_correction: bool,
    /// Keep the confidence map as a spatially varying regulariser weight.
    pub adaptive_regularisation: bool,
    /// Gate badly registered slices by NCC against the simulation.
    pub structural_exclusion: bool,
    /// Use free-form instead of rigid slice poses.
    pub ffd: bool,
    /// Control-point spacing (mm) of free-form poses.
    pub cp_spacing: f64,
    /// In-plane Gaussian blur (0.6 pixel spacings) at slice creation.
    pub blur_slices: bool,
    /// Trust the initial poses and skip registration in the first round.
    pub skip_first_registration: bool,
    /// Slice indices excluded from the reconstruction outright.
    pub force_excluded: Vec<usize>,
    /// Fraction of the maximum intensity below which voxels are ignored
    /// by the volume bias correction.
    pub low_intensity_cutoff: f64,
    /// Base of the sigma floors (floor = step^2 / 6.28).
    pub step: f64,
    /// Target mean intensity of stack matching.
    pub average_value: f64,
}

impl Default for ReconParams {
    fn default() -> Self {
        Self {
            resolution: 0.0,
            delta: 150.0,
            lambda: 0.02,
            sigma_bias: 12.0,
            global_ncc_threshold: 0.65,
            outer_iterations: 3,
            sr_iterations: 7,
            intensity_matching: true,
            bias_correction: true,
            global_bias_correction: false,
            adaptive_regularisation: false,
            structural_exclusion: false,
            ffd: false,
            cp_spacing: 10.0,
            blur_slices: false,
            skip_first_registration: true,
            force_excluded: Vec::new(),
            low_intensity_cutoff: 0.01,
            step: 0.0001,
            average_value: 700.0,
        }
    }
}

/// Everything the engine tracks for one acquired slice.
#[derive(Debug, Clone)]
pub struct SliceRecord {
    /// The slice intensities; -1 marks masked/ignored pixels.
    pub(crate) image: Image,
    /// Current pose mapping slice world into reconstruction world.
    pub(crate) pose: SlicePose,
    /// Owning stack.
    pub(crate) stack: usize,
    /// Acquisition package within the stack.
    pub(crate) package: usize,
    /// z position within the owning stack.
    pub(crate) pos_in_stack: usize,
    /// Degenerate intensity range; skipped by registration.
    pub(crate) zero: bool,
    /// Sparse PSF coefficients under the current pose.
    pub(crate) coeffs: SliceCoeffs,
    /// Any PSF mass inside the mask ROI.
    pub(crate) inside: bool,
    /// Voxel-level inlier posteriors w_i.
    pub(crate) weights: Image,
    /// Log-multiplicative bias field b_i.
    pub(crate) bias: Image,
    /// Intensity scale sigma_i.
    pub(crate) scale: f64,
    /// Slice-level inlier posterior pi_i.
    pub(crate) slice_weight: f64,
    /// Structural registration gate: 1 passes, -1 is excluded.
    pub(crate) reg_weight: f64,
    /// Forward projection of the current volume.
    pub(crate) simulated: Image,
    /// Per-pixel PSF normaliser of the projection.
    pub(crate) sim_weights: Image,
    /// Per-pixel flag: projection touched the mask ROI.
    pub(crate) sim_inside: Image,
    /// Current residual slice.
    pub(crate) dif: Image,
    /// Slice potential from the last E-step (-1 = pinned).
    pub(crate) potential: f64,
    /// Optional tissue prior on the slice grid.
    pub(crate) probability_map: Option<Image>,
}

/// Slice-to-volume reconstruction engine.
pub struct Reconstruction {
    pub params: ReconParams,

    pub(crate) volume: Image,
    pub(crate) mask: Image,
    pub(crate) template_created: bool,
    pub(crate) have_mask: bool,

    pub(crate) slices: Vec<SliceRecord>,
    pub(crate) stack_factor: Vec<f64>,

    pub(crate) volume_weights: Image,
    pub(crate) confidence_map: Image,
    pub(crate) average_volume_weight: f64,
    pub(crate) small_slices: Vec<usize>,
    /// Origin-reset offsets kept between remote registration waves.
    pub(crate) offset_matrices: Vec<nalgebra::Matrix4<f64>>,

    // Smoothing parameters derived from params.delta / params.lambda.
    pub(crate) delta: f64,
    pub(crate) lambda: f64,
    pub(crate) alpha: f64,

    // Global EM parameters.
    pub(crate) sigma: f64,
    pub(crate) sigma_s: f64,
    pub(crate) sigma_s2: f64,
    pub(crate) mean_s: f64,
    pub(crate) mean_s2: f64,
    pub(crate) mix: f64,
    pub(crate) mix_s: f64,
    pub(crate) m: f64,
    pub(crate) min_intensity: f64,
    pub(crate) max_intensity: f64,
}

impl Reconstruction {
    pub fn new(params: ReconParams) -> Self {
        let placeholder = Image::new((1, 1, 1), (1.0, 1.0, 1.0), &[
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]);
        let mut recon = Self {
            volume: placeholder.clone(),
            mask: placeholder.clone(),
            template_created: false,
            have_mask: false,
            slices: Vec::new(),
            stack_factor: Vec::new(),
            volume_weights: placeholder.clone(),
            confidence_map: placeholder,
            average_volume_weight: 0.0,
            small_slices: Vec::new(),
            offset_matrices: Vec::new(),
            delta: 1.0,
            lambda: 0.1,
            alpha: 1.0,
            sigma: 0.0,
            sigma_s: 0.025,
            sigma_s2: 0.025,
            mean_s: 0.0,
            mean_s2: 0.0,
            mix: 0.9,
            mix_s: 0.9,
            m: 0.0,
            min_intensity: 0.0,
            max_intensity: 0.0,
            params,
        };
        let (delta, lambda) = (recon.params.delta, recon.params.lambda);
        recon.set_smoothing_parameters(delta, lambda);
        recon
    }

    /// Derive the internal regularisation constants. The step size is
    /// clamped to 1 so that the effective regulariser factor
    /// alpha*lambda/delta^2 equals the user lambda.
    pub fn set_smoothing_parameters(&mut self, delta: f64, lambda: f64) {
        self.delta = delta;
        self.lambda = lambda * delta * delta;
        self.alpha = ((0.05 / lambda) * delta * delta).min(1.0);
    }

    /// The reconstructed volume.
    pub fn reconstructed(&self) -> &Image {
        &self.volume
    }

    /// The reconstruction mask.
    pub fn mask(&self) -> &Image {
        &self.mask
    }

    pub fn n_slices(&self) -> usize {
        self.slices.len()
    }

    /// Current pose of slice `i`.
    pub fn slice_pose(&self, i: usize) -> &SlicePose {
        &self.slices[i].pose
    }

    /// Replace the pose of slice `i`.
    pub fn set_slice_pose(&mut self, i: usize, pose: SlicePose) {
        self.slices[i].pose = pose;
    }

    /// Slice posterior weight of slice `i`.
    pub fn slice_weight(&self, i: usize) -> f64 {
        self.slices[i].slice_weight
    }

    /// Per-slice intensity scale of slice `i`.
    pub fn slice_scale(&self, i: usize) -> f64 {
        self.slices[i].scale
    }

    /// Whether slice `i` overlaps the mask ROI.
    pub fn slice_inside(&self, i: usize) -> bool {
        self.slices[i].inside
    }

    /// Tissue prior supplied for slice `i`, if any.
    pub fn probability_map(&self, i: usize) -> Option<&Image> {
        self.slices[i].probability_map.as_ref()
    }

    /// The acquired image of slice `i`.
    pub fn slice_image(&self, i: usize) -> &Image {
        &self.slices[i].image
    }

    /// Replace the intensities of slice `i` (grid and pose are kept).
    pub fn set_slice_intensities(&mut self, i: usize, data: &[f64]) {
        assert_eq!(data.len(), self.slices[i].image.len(), "slice grid mismatch");
        self.slices[i].image.data.copy_from_slice(data);
    }

    /// Visit every PSF coefficient of slice `i` as (x, y, z, weight).
    pub fn for_each_coefficient<F>(&self, i: usize, mut f: F)
    where
        F: FnMut(usize, usize, usize, f64),
    {
        let rec = &self.slices[i];
        for p in 0..rec.coeffs.n_pixels() {
            for c in rec.coeffs.pixel(p) {
                f(c.x as usize, c.y as usize, c.z as usize, c.value);
            }
        }
    }

    /// Accumulated PSF mass at a linear voxel index.
    pub fn volume_weight_at(&self, idx: usize) -> f64 {
        self.volume_weights.data[idx]
    }

    /// Voxel-level inlier posteriors of slice `i`.
    pub fn voxel_weights(&self, i: usize) -> &Image {
        &self.slices[i].weights
    }

    /// Log-bias field of slice `i`.
    pub fn slice_bias(&self, i: usize) -> &Image {
        &self.slices[i].bias
    }

    /// Override the intensity scale of slice `i`.
    pub fn set_slice_scale(&mut self, i: usize, scale: f64) {
        self.slices[i].scale = scale;
    }

    /// Current voxel-level noise variance of the EM model.
    pub fn voxel_sigma(&self) -> f64 {
        self.sigma
    }

    /// Forward projection of slice `i` from the last simulation pass.
    pub fn simulated_slice(&self, i: usize) -> &Image {
        &self.slices[i].simulated
    }

    /// Per-pixel PSF normaliser of slice `i`.
    pub fn sim_weights(&self, i: usize) -> &Image {
        &self.slices[i].sim_weights
    }

    /// Current residual of slice `i`.
    pub fn slice_residual(&self, i: usize) -> &Image {
        &self.slices[i].dif
    }

    /// Mean PSF mass per masked voxel.
    pub fn average_volume_weight(&self) -> f64 {
        self.average_volume_weight
    }

    pub(crate) fn is_force_excluded(&self, index: usize) -> bool {
        self.params.force_excluded.contains(&index)
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Create the reconstruction template from a reference stack: the
    /// stack is enlarged by two slices in z (in case the top of the head
    /// is cut off) and resampled to an isotropic grid. Returns the
    /// resolution actually used.
    pub fn create_template(&mut self, stack: &Image, resolution: f64) -> Result<f64> {
        let (dx, dy, dz) = stack.voxel_size();
        let d = if resolution <= 0.0 {
            dx.min(dy).min(dz)
        } else {
            resolution
        };
        info!("reconstructed volume voxel size : {} mm", d);

        let (smin, _) = stack.min_max();
        let padding = if smin < -0.1 {
            PADDING
        } else if smin < 0.1 {
            0.0
        } else {
            f64::NEG_INFINITY
        };
        // Without a recognisable background value the grid is padded
        // with zeros instead.
        let fill = if padding.is_finite() { padding } else { 0.0 };
        let enlarged = enlarge_z(stack, 2, fill);
        self.volume = resample_isotropic_padded(&enlarged, d, fill);
        self.template_created = true;
        Ok(d)
    }

    /// Keep the reference stack grid as-is (anisotropic output). Returns
    /// the in-plane resolution.
    pub fn create_template_aniso(&mut self, stack: &Image) -> Result<f64> {
        let (dx, dy, dz) = stack.voxel_size();
        info!("constructing volume with anisotropic voxel size {} {} {}", dx, dy, dz);
        self.volume = stack.clone();
        self.template_created = true;
        Ok(dx)
    }

    /// Set the reconstruction mask, resampled nearest-neighbour onto the
    /// template grid. With `sigma > 0` the mask is smoothed and
    /// re-binarised at `threshold` first. `None` selects an all-one mask.
    pub fn set_mask(&mut self, mask: Option<&Image>, sigma: f64, threshold: f64) -> Result<()> {
        if !self.template_created {
            return Err(ReconError::precondition(
                "create the template before setting the mask, so that the mask \
                 can be resampled to the correct dimensions"
                    .to_string(),
            ));
        }

        self.mask = Image::zeros_like(&self.volume);
        match mask {
            Some(m) => {
                let mut prepared = m.clone();
                if sigma > 0.0 {
                    prepared = gaussian_blur(&prepared, sigma);
                    prepared.threshold_normalised(threshold);
                } else {
                    prepared.binarise();
                }
                let src = prepared;
                resample_fill(&src, &mut self.mask, |w| w, true, 0.0);
                // Anything that fell outside the source grid is background.
                for v in self.mask.data.iter_mut() {
                    if *v != 1.0 {
                        *v = 0.0;
                    }
                }
            }
            None => {
                self.mask.data.iter_mut().for_each(|v| *v = 1.0);
            }
        }
        self.have_mask = true;

        let roi_voxels = self.mask.data.iter().filter(|&&v| v > 0.1).count();
        if roi_voxels == 0 {
            return Err(ReconError::EmptyRoi(
                "mask has no overlap with the reconstruction volume".to_string(),
            ));
        }
        let (dx, dy, dz) = self.volume.voxel_size();
        info!("ROI volume : {} cc", roi_voxels as f64 * dx * dy * dz / 1000.0);
        Ok(())
    }

    /// Per-stack linear intensity matching inside the mask ROI: every
    /// stack is scaled so its (or, with `together`, the joint) ROI mean
    /// hits `average_value`. Records the factors for later restoration.
    pub fn match_stack_intensities_with_masking(
        &mut self,
        stacks: &mut [Image],
        stack_transformations: &[RigidTransform],
        average_value: f64,
        together: bool,
    ) -> Result<()> {
        let mut stack_average = Vec::with_capacity(stacks.len());
        for (ind, stack) in stacks.iter().enumerate() {
            let (nx, ny, nz) = stack.dims();
            let mut sum = 0.0;
            let mut num = 0usize;
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        let w = stack_transformations[ind]
                            .transform_point(stack.image_to_world([i as f64, j as f64, k as f64]));
                        let c = self.mask.world_to_image(w);
                        let (ci, cj, ck) =
                            (c[0].round() as i64, c[1].round() as i64, c[2].round() as i64);
                        if self.mask.contains(ci, cj, ck)
                            && self.mask.at(ci as usize, cj as usize, ck as usize) == 1.0
                        {
                            sum += stack.at(i, j, k);
                            num += 1;
                        }
                    }
                }
            }
            if num == 0 {
                return Err(ReconError::EmptyRoi(format!(
                    "stack {} has no overlap with ROI",
                    ind
                )));
            }
            stack_average.push(sum / num as f64);
        }

        let global_average = stack_average.iter().sum::<f64>() / stack_average.len() as f64;
        info!("stack average intensities are {:?}", stack_average);

        self.stack_factor.clear();
        for (ind, stack) in stacks.iter_mut().enumerate() {
            let factor = average_value / if together { global_average } else { stack_average[ind] };
            self.stack_factor.push(factor);
            for v in stack.data.iter_mut() {
                if *v > 0.0 {
                    *v *= factor;
                }
            }
        }
        info!("slice intensity factors are {:?}", self.stack_factor);
        Ok(())
    }

    /// Split the stacks into slice records. Slice z spacing becomes the
    /// acquired thickness; poses start from the owning stack transform.
    pub fn create_slices(
        &mut self,
        stacks: &[Image],
        stack_transformations: &[RigidTransform],
        thickness: &[f64],
        packages: Option<&[usize]>,
        probability_maps: Option<&[Image]>,
    ) -> Result<()> {
        if stacks.len() != stack_transformations.len() || stacks.len() != thickness.len() {
            return Err(ReconError::dimension_mismatch(
                "stacks, transformations and thickness lists differ in length".to_string(),
            ));
        }
        self.slices.clear();
        if self.stack_factor.is_empty() {
            self.stack_factor = vec![1.0; stacks.len()];
        }

        for (si, stack) in stacks.iter().enumerate() {
            let (_, _, nz) = stack.dims();
            let n_pack = packages.map(|p| p[si]).unwrap_or(1).max(1);
            for k in 0..nz {
                let mut slice = stack.extract_slice(k, thickness[si]);
                let (smin, smax) = slice.min_max();
                let zero = !(smax > 1.0 && smax - smin > 1.0);

                if self.params.blur_slices {
                    slice = gaussian_blur_with_padding(&slice, 0.6 * slice.voxel_size().0, PADDING);
                }

                let zeros = Image::zeros_like(&slice);
                let ones = Image::filled_like(&slice, 1.0);
                let pose = if self.params.ffd {
                    let mut ffd = crate::transform::FreeFormTransform::for_slice(
                        &slice,
                        self.params.cp_spacing,
                    );
                    ffd.set_rigid(stack_transformations[si].clone());
                    SlicePose::FreeForm(ffd)
                } else {
                    SlicePose::Rigid(stack_transformations[si].clone())
                };
                let probability_map = probability_maps.map(|maps| maps[si].extract_slice(k, thickness[si]));

                self.slices.push(SliceRecord {
                    weights: ones.clone(),
                    bias: zeros.clone(),
                    simulated: zeros.clone(),
                    sim_weights: ones.clone(),
                    sim_inside: ones,
                    dif: zeros,
                    coeffs: SliceCoeffs::empty(slice.len()),
                    image: slice,
                    pose,
                    stack: si,
                    package: k % n_pack,
                    pos_in_stack: k,
                    zero,
                    inside: false,
                    scale: 1.0,
                    slice_weight: 1.0,
                    reg_weight: 1.0,
                    potential: -1.0,
                    probability_map,
                });
            }
        }
        info!("number of slices: {}", self.slices.len());
        Ok(())
    }

    /// Seed every slice pose from its stack transform.
    pub fn initialise_with_stack_transformations(
        &mut self,
        stack_transformations: &[RigidTransform],
    ) {
        for rec in self.slices.iter_mut() {
            let t = stack_transformations[rec.stack].clone();
            match &mut rec.pose {
                SlicePose::Rigid(r) => *r = t,
                SlicePose::FreeForm(f) => f.set_rigid(t),
            }
        }
    }

    /// Project the volume mask through each slice pose and pad pixels
    /// that fall outside the ROI (or below the padding cutoff).
    pub fn mask_slices(&mut self) {
        if !self.have_mask {
            warn!("could not mask slices because no mask has been set");
            return;
        }
        let mask = &self.mask;
        self.slices.par_iter_mut().for_each(|rec| {
            let (nx, ny, _) = rec.image.dims();
            for j in 0..ny {
                for i in 0..nx {
                    let mut v = rec.image.at(i, j, 0);
                    // Values below the padding cutoff are background.
                    if v < 0.01 {
                        v = PADDING;
                    }
                    let w = rec
                        .pose
                        .transform_point(rec.image.image_to_world([i as f64, j as f64, 0.0]));
                    let c = mask.world_to_image(w);
                    let inside = sample_nearest(mask, c, 0.0);
                    if inside == 0.0 {
                        v = PADDING;
                    }
                    rec.image.set(i, j, 0, v);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Forward operator bookkeeping
    // ------------------------------------------------------------------

    /// Rebuild the sparse PSF coefficients of every slice under the
    /// current poses, together with the volume weight image and the
    /// average volume weight.
    pub fn coeff_init(&mut self) {
        let volume = &self.volume;
        let mask = &self.mask;
        self.slices.par_iter_mut().for_each(|rec| {
            let (coeffs, inside) =
                compute_slice_coefficients(&rec.image, &rec.pose, volume, mask);
            rec.coeffs = coeffs;
            rec.inside = inside;
        });

        // Deposition is kept serial: concurrent adds into the shared
        // volume image would race.
        self.volume_weights = Image::zeros_like(&self.volume);
        for (index, rec) in self.slices.iter().enumerate() {
            if self.is_force_excluded(index) {
                continue;
            }
            for p in 0..rec.coeffs.n_pixels() {
                for c in rec.coeffs.pixel(p) {
                    let idx = self
                        .volume_weights
                        .idx(c.x as usize, c.y as usize, c.z as usize);
                    self.volume_weights.data[idx] += c.value;
                }
            }
        }

        let mut sum = 0.0;
        let mut num = 0usize;
        for (w, m) in self.volume_weights.data.iter().zip(self.mask.data.iter()) {
            if *m == 1.0 {
                sum += *w;
                num += 1;
            }
        }
        self.average_volume_weight = if num > 0 { sum / num as f64 } else { 0.0 };
        info!("average volume weight is {}", self.average_volume_weight);
    }

    // ------------------------------------------------------------------
    // Outer iterator
    // ------------------------------------------------------------------

    /// Run the full reconstruction: alternating slice-to-volume
    /// registration, forward-operator rebuilds and the inner EM +
    /// super-resolution loop, finishing with the final masking pass.
    pub fn run(&mut self) -> Result<()> {
        if !self.template_created || !self.have_mask {
            return Err(ReconError::precondition(
                "create the template and set the mask before running".to_string(),
            ));
        }

        for outer in 0..self.params.outer_iterations {
            info!("outer iteration {}", outer);

            if outer > 0 || !self.params.skip_first_registration {
                self.register_slices_to_volume();
                if self.params.structural_exclusion {
                    self.structural_exclusion();
                }
            }

            self.coeff_init();

            if outer == 0 {
                self.gaussian_reconstruction();
                self.initialize_em();
                self.initialize_em_values();
                self.simulate_slices();
                self.initialize_robust_statistics();
            }

            for inner in 0..self.params.sr_iterations {
                info!("inner iteration {}", inner);
                self.simulate_slices();
                if inner == 0 {
                    self.e_step();
                    self.m_step(inner + 1);
                }
                if self.params.intensity_matching {
                    self.scale();
                }
                if self.params.bias_correction {
                    self.bias();
                }
                self.simulate_slices();
                self.superresolution(inner + 1);
                if self.params.bias_correction {
                    self.normalise_bias(inner);
                }
            }

            info!("{}", self.evaluate(outer));
            let report = self.recon_quality_report();
            info!(
                "quality: ncc = {:.4}, nrmse = {:.4}, average weight = {:.4}, excluded = {:.4}",
                report.ncc, report.nrmse, report.average_volume_weight, report.ratio_excluded
            );
        }

        self.mask_volume();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output-side helpers
    // ------------------------------------------------------------------

    /// Pad every voxel outside the mask in the reconstructed volume.
    pub fn mask_volume(&mut self) {
        for (v, m) in self.volume.data.iter_mut().zip(self.mask.data.iter()) {
            if *m == 0.0 {
                *v = PADDING;
            }
        }
    }

    /// Undo stack intensity matching on the slices (for external
    /// reporting in the acquired intensity range).
    pub fn restore_slice_intensities(&mut self) {
        let factors = self.stack_factor.clone();
        self.slices.par_iter_mut().for_each(|rec| {
            let factor = factors[rec.stack];
            for v in rec.image.data.iter_mut() {
                if *v > 0.0 {
                    *v /= factor;
                }
            }
        });
    }

    /// Global intensity rescale of the reconstruction against the
    /// weighted simulated slices.
    pub fn scale_volume(&mut self) {
        let mut scalenum = 0.0;
        let mut scaleden = 0.0;
        for rec in &self.slices {
            for idx in 0..rec.image.len() {
                if rec.image.data[idx] != PADDING && rec.sim_weights.data[idx] > 0.99 {
                    let w = rec.weights.data[idx] * rec.slice_weight;
                    scalenum += w * rec.image.data[idx] * rec.simulated.data[idx];
                    scaleden += w * rec.simulated.data[idx] * rec.simulated.data[idx];
                }
            }
        }
        let scale = if scaleden > 0.0 { scalenum / scaleden } else { 1.0 };
        info!("volume scale : {}", scale);
        for v in self.volume.data.iter_mut() {
            if *v > 0.0 {
                *v *= scale;
            }
        }
    }

    /// Listing of included / excluded / outside slices for one iteration.
    pub fn evaluate(&self, iter: usize) -> String {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut outside = Vec::new();
        for (i, rec) in self.slices.iter().enumerate() {
            if rec.inside {
                if rec.slice_weight >= 0.5 {
                    included.push(i);
                } else {
                    excluded.push(i);
                }
            } else {
                outside.push(i);
            }
        }
        let mut out = String::new();
        writeln!(out, "iteration {}:", iter).ok();
        writeln!(out, "included slices: {:?} (total {})", included, included.len()).ok();
        writeln!(out, "excluded slices: {:?} (total {})", excluded, excluded.len()).ok();
        write!(out, "outside slices: {:?} (total {})", outside, outside.len()).ok();
        out
    }

    /// Mean NCC / NRMSE between corrected slices and their simulations,
    /// plus the excluded-slice ratio.
    pub fn recon_quality_report(&self) -> QualityReport {
        let mut ncc_sum = 0.0;
        let mut nrmse_sum = 0.0;
        for rec in &self.slices {
            let mut corrected = rec.image.clone();
            for idx in 0..corrected.len() {
                if corrected.data[idx] > -0.01 {
                    corrected.data[idx] *= (-rec.bias.data[idx]).exp() * rec.scale;
                } else {
                    corrected.data[idx] = 0.0;
                }
            }
            let ncc = compute_ncc(&corrected, &rec.simulated, 0.0, None);
            if ncc > -1.0 {
                ncc_sum += ncc;
            }
            nrmse_sum += slice_nrmse(&rec.image, &rec.bias, rec.scale, &rec.simulated);
        }

        let n = self.slices.len().max(1) as f64;
        let mut ncc = ncc_sum / n;
        let mut nrmse = nrmse_sum / n;
        if !ncc.is_finite() {
            ncc = 0.0;
        }
        if !nrmse.is_finite() {
            nrmse = 0.0;
        }
        let count_excluded = self
            .slices
            .iter()
            .filter(|rec| rec.slice_weight < 0.5)
            .count();
        QualityReport {
            ncc,
            nrmse,
            average_volume_weight: self.average_volume_weight,
            ratio_excluded: count_excluded as f64 / n,
        }
    }

    /// Write the per-slice summary CSV: stack, slice, pose parameters,
    /// weight, inside flag and scale.
    pub fn save_slice_info(&self, path: &Path) -> Result<()> {
        let mut out = String::from("Stack,Slice,Rx,Ry,Rz,Tx,Ty,Tz,Weight,Inside,Scale\n");
        for (i, rec) in self.slices.iter().enumerate() {
            let rigid = rec.pose.rigid();
            let [tx, ty, tz] = rigid.translation();
            let [rx, ry, rz] = rigid.rotation();
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{}",
                rec.stack,
                i,
                rx,
                ry,
                rz,
                tx,
                ty,
                tz,
                rec.slice_weight,
                if rec.inside { 1 } else { 0 },
                rec.scale
            )
            .ok();
        }
        std::fs::write(path, out)
            .map_err(|e| ReconError::io(format!("failed to write '{}': {}", path.display(), e)))
    }
}

/// Invert a list of stack transformations in place. An involution:
/// applying it twice restores the input.
pub fn invert_stack_transformations(stack_transformations: &mut [RigidTransform]) {
    for t in stack_transformations.iter_mut() {
        t.invert();
    }
}
