//! Gaussian point-spread-function forward operator
//!
//! Each slice pixel observes a small neighbourhood of reconstruction
//! voxels through the acquisition PSF: a 3D Gaussian with in-plane FWHM of
//! 1.2 pixel spacings and through-plane FWHM equal to the slice thickness.
//! The operator is built by oversampling every pixel within the PSF
//! support, mapping each sub-sample through the slice pose into the
//! reconstruction grid and splitting its Gaussian mass trilinearly over
//! the neighbouring voxels.
//!
//! Coefficients are stored as one flat arena per slice with per-pixel
//! offsets rather than nested vectors; the coefficient lists dominate the
//! engine's memory footprint and this keeps them in a handful of
//! contiguous allocations.

use std::collections::HashMap;

use crate::image::Image;
use crate::transform::SlicePose;

/// FWHM-to-sigma conversion factor, 2*sqrt(2*ln 2).
const FWHM_TO_SIGMA: f64 = 2.3548;

/// One (voxel, weight) entry of the sparse forward operator.
#[derive(Debug, Clone, Copy)]
pub struct PsfCoeff {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub value: f64,
}

/// Sparse PSF coefficients of one slice: a flat arena of coefficients
/// indexed through per-pixel offsets (pixel p owns
/// `coeffs[offsets[p]..offsets[p+1]]`).
#[derive(Debug, Clone, Default)]
pub struct SliceCoeffs {
    offsets: Vec<u32>,
    coeffs: Vec<PsfCoeff>,
}

impl SliceCoeffs {
    /// Empty operator for a slice with `n_pixels` pixels.
    pub fn empty(n_pixels: usize) -> Self {
        Self {
            offsets: vec![0; n_pixels + 1],
            coeffs: Vec::new(),
        }
    }

    /// Coefficients of pixel `p` (Fortran pixel index).
    #[inline]
    pub fn pixel(&self, p: usize) -> &[PsfCoeff] {
        let lo = self.offsets[p] as usize;
        let hi = self.offsets[p + 1] as usize;
        &self.coeffs[lo..hi]
    }

    pub fn n_pixels(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total number of stored coefficients.
    pub fn total_coeffs(&self) -> usize {
        self.coeffs.len()
    }

    /// Number of pixels with at least one coefficient.
    pub fn covered_pixels(&self) -> usize {
        (0..self.n_pixels())
            .filter(|&p| self.offsets[p + 1] > self.offsets[p])
            .count()
    }
}

/// Gaussian PSF of one slice; sigmas in mm.
#[derive(Debug, Clone, Copy)]
pub struct SlicePsf {
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub sigma_z: f64,
}

impl SlicePsf {
    /// PSF for a slice with the given in-plane spacing and thickness.
    pub fn for_slice(dx: f64, dy: f64, thickness: f64) -> Self {
        Self {
            sigma_x: 1.2 * dx / FWHM_TO_SIGMA,
            sigma_y: 1.2 * dy / FWHM_TO_SIGMA,
            sigma_z: thickness / FWHM_TO_SIGMA,
        }
    }

    #[inline]
    fn density(&self, ox: f64, oy: f64, oz: f64) -> f64 {
        (-(ox * ox / (2.0 * self.sigma_x * self.sigma_x)
            + oy * oy / (2.0 * self.sigma_y * self.sigma_y)
            + oz * oz / (2.0 * self.sigma_z * self.sigma_z)))
            .exp()
    }
}

/// Sub-sample offsets (in the slice-local frame, mm) and their Gaussian
/// masses, covering two sigma along each axis at `step` resolution. The
/// same lattice serves every pixel of the slice.
fn psf_samples(psf: &SlicePsf, step: f64) -> (Vec<([f64; 3], f64)>, f64) {
    let rx = (2.0 * psf.sigma_x / step).ceil() as i64;
    let ry = (2.0 * psf.sigma_y / step).ceil() as i64;
    let rz = (2.0 * psf.sigma_z / step).ceil() as i64;
    let mut samples = Vec::with_capacity(((2 * rx + 1) * (2 * ry + 1) * (2 * rz + 1)) as usize);
    let mut total = 0.0;
    for sz in -rz..=rz {
        for sy in -ry..=ry {
            for sx in -rx..=rx {
                let o = [sx as f64 * step, sy as f64 * step, sz as f64 * step];
                let w = psf.density(o[0], o[1], o[2]);
                total += w;
                samples.push((o, w));
            }
        }
    }
    (samples, total)
}

/// Build the PSF coefficients of one slice against the reconstruction
/// grid under the current pose. Returns the operator together with the
/// inside flag: whether any deposited voxel lies in the mask ROI.
///
/// Per-pixel weights are normalised by the full kernel mass, so interior
/// pixels sum to one while pixels leaning out of the volume keep a
/// proportionally smaller total, which the forward projection later
/// detects through its 0.98 normaliser threshold.
pub fn compute_slice_coefficients(
    slice: &Image,
    pose: &SlicePose,
    volume: &Image,
    mask: &Image,
) -> (SliceCoeffs, bool) {
    let (snx, sny, _) = slice.dims();
    let (sdx, sdy, sdz) = slice.voxel_size();
    let (vnx, vny, vnz) = volume.dims();
    let psf = SlicePsf::for_slice(sdx, sdy, sdz);

    // Oversample at half the reconstruction resolution.
    let step = volume.voxel_size().0 / 2.0;
    let (samples, kernel_mass) = psf_samples(&psf, step);

    let ux = slice.axis_direction(0);
    let uy = slice.axis_direction(1);
    let uz = slice.axis_direction(2);

    let mut out = SliceCoeffs {
        offsets: Vec::with_capacity(snx * sny + 1),
        coeffs: Vec::new(),
    };
    out.offsets.push(0);
    let mut inside = false;
    let mut deposit: HashMap<usize, f64> = HashMap::new();

    for j in 0..sny {
        for i in 0..snx {
            let value = slice.at(i, j, 0);
            if value > -0.01 {
                // Skip pixels whose centre misses the reconstruction grid.
                let centre_world =
                    pose.transform_point(slice.image_to_world([i as f64, j as f64, 0.0]));
                let c = volume.world_to_image(centre_world);
                let (ci, cj, ck) = (c[0].round() as i64, c[1].round() as i64, c[2].round() as i64);
                if volume.contains(ci, cj, ck) {
                    deposit.clear();
                    let pixel_world = slice.image_to_world([i as f64, j as f64, 0.0]);
                    for &(o, w) in &samples {
                        let p = [
                            pixel_world[0] + o[0] * ux[0] + o[1] * uy[0] + o[2] * uz[0],
                            pixel_world[1] + o[0] * ux[1] + o[1] * uy[1] + o[2] * uz[1],
                            pixel_world[2] + o[0] * ux[2] + o[1] * uy[2] + o[2] * uz[2],
                        ];
                        let v = volume.world_to_image(pose.transform_point(p));
                        trilinear_deposit(v, w, vnx, vny, vnz, &mut deposit);
                    }

                    let mut entries: Vec<(usize, f64)> =
                        deposit.iter().map(|(&idx, &w)| (idx, w)).collect();
                    // HashMap order is not stable; keep the arena deterministic.
                    entries.sort_unstable_by_key(|&(idx, _)| idx);
                    for (idx, w) in entries {
                        let x = idx % vnx;
                        let y = (idx / vnx) % vny;
                        let z = idx / (vnx * vny);
                        if mask.data[idx] > 0.5 {
                            inside = true;
                        }
                        out.coeffs.push(PsfCoeff {
                            x: x as u32,
                            y: y as u32,
                            z: z as u32,
                            value: w / kernel_mass,
                        });
                    }
                }
            }
            out.offsets.push(out.coeffs.len() as u32);
        }
    }
    (out, inside)
}

/// Split `w` trilinearly over the eight voxels around continuous index
/// `v`; out-of-grid corners are dropped.
#[inline]
fn trilinear_deposit(
    v: [f64; 3],
    w: f64,
    nx: usize,
    ny: usize,
    nz: usize,
    deposit: &mut HashMap<usize, f64>,
) {
    let fx = v[0].floor();
    let fy = v[1].floor();
    let fz = v[2].floor();
    let tx = v[0] - fx;
    let ty = v[1] - fy;
    let tz = v[2] - fz;
    for dk in 0..2i64 {
        let k = fz as i64 + dk;
        if k < 0 || k as usize >= nz {
            continue;
        }
        let wz = if dk == 0 { 1.0 - tz } else { tz };
        for dj in 0..2i64 {
            let j = fy as i64 + dj;
            if j < 0 || j as usize >= ny {
                continue;
            }
            let wy = if dj == 0 { 1.0 - ty } else { ty };
            for di in 0..2i64 {
                let i = fx as i64 + di;
                if i < 0 || i as usize >= nx {
                    continue;
                }
                let wx = if di == 0 { 1.0 - tx } else { tx };
                let mass = w * wx * wy * wz;
                if mass > 0.0 {
                    *deposit
                        .entry(i as usize + j as usize * nx + k as usize * nx * ny)
                        .or_insert(0.0) += mass;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RigidTransform;

    fn unit_volume(n: usize) -> Image {
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Image::new((n, n, n), (1.0, 1.0, 1.0), &affine)
    }

    fn centred_slice(n: usize, k: f64, thickness: f64) -> Image {
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, thickness, k,
            0.0, 0.0, 0.0, 1.0,
        ];
        let mut s = Image::new((n, n, 1), (1.0, 1.0, thickness), &affine);
        s.data.iter_mut().for_each(|v| *v = 10.0);
        s
    }

    #[test]
    fn test_psf_sigmas() {
        let psf = SlicePsf::for_slice(1.0, 1.0, 3.0);
        assert!((psf.sigma_x - 1.2 / 2.3548).abs() < 1e-12);
        assert!((psf.sigma_z - 3.0 / 2.3548).abs() < 1e-12);
    }

    #[test]
    fn test_interior_pixel_mass_near_one() {
        let volume = unit_volume(16);
        let mask = Image::filled_like(&volume, 1.0);
        let slice = centred_slice(16, 8.0, 2.0);
        let pose = SlicePose::Rigid(RigidTransform::identity());
        let (coeffs, inside) = compute_slice_coefficients(&slice, &pose, &volume, &mask);
        assert!(inside);
        let p = coeffs.pixel(8 + 8 * 16);
        assert!(!p.is_empty());
        let mass: f64 = p.iter().map(|c| c.value).sum();
        assert!(
            (mass - 1.0).abs() < 0.05,
            "interior pixel mass should be close to 1, got {}",
            mass
        );
        for c in p {
            assert!(c.value > 0.0);
        }
    }

    #[test]
    fn test_padding_pixels_have_no_coefficients() {
        let volume = unit_volume(12);
        let mask = Image::filled_like(&volume, 1.0);
        let mut slice = centred_slice(12, 6.0, 2.0);
        slice.data.iter_mut().for_each(|v| *v = -1.0);
        let pose = SlicePose::Rigid(RigidTransform::identity());
        let (coeffs, inside) = compute_slice_coefficients(&slice, &pose, &volume, &mask);
        assert_eq!(coeffs.total_coeffs(), 0);
        assert!(!inside);
    }

    #[test]
    fn test_slice_outside_volume_is_outside_mask() {
        let volume = unit_volume(12);
        let mask = Image::filled_like(&volume, 1.0);
        // A slice 100 mm away from the grid.
        let slice = centred_slice(12, 100.0, 2.0);
        let pose = SlicePose::Rigid(RigidTransform::identity());
        let (coeffs, inside) = compute_slice_coefficients(&slice, &pose, &volume, &mask);
        assert_eq!(coeffs.total_coeffs(), 0);
        assert!(!inside);
    }

    #[test]
    fn test_coefficients_follow_the_pose() {
        let volume = unit_volume(16);
        let mask = Image::filled_like(&volume, 1.0);
        let slice = centred_slice(16, 4.0, 2.0);
        // Push the slice 4 mm along z; coefficients should move with it.
        let pose = SlicePose::Rigid(RigidTransform::from_params([0.0, 0.0, 4.0, 0.0, 0.0, 0.0]));
        let (coeffs, _) = compute_slice_coefficients(&slice, &pose, &volume, &mask);
        let p = coeffs.pixel(8 + 8 * 16);
        let mean_z: f64 =
            p.iter().map(|c| c.z as f64 * c.value).sum::<f64>() / p.iter().map(|c| c.value).sum::<f64>();
        assert!(
            (mean_z - 8.0).abs() < 0.6,
            "coefficient centroid should sit near z=8, got {}",
            mean_z
        );
    }
}
