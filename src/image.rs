//! Image container with physical-space metadata
//!
//! Volumes and slices share one representation: a flat `Vec<f64>` in
//! Fortran (column-major) order, `index = x + y*nx + z*nx*ny`, plus a 4x4
//! affine mapping continuous voxel indices to world millimetres. A slice
//! is simply an image with `nz == 1` whose z spacing carries the acquired
//! slice thickness.
//!
//! The padding value -1 marks "outside mask / undefined"; every consumer
//! tests `> -0.01` for valid pixels so that 0 remains a legal intensity.

use nalgebra::{Matrix4, Vector4};

use crate::error::{ReconError, Result};

/// Padding value marking undefined voxels.
pub const PADDING: f64 = -1.0;

/// Index into a 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Scalar image on a regular 3D grid with an affine world mapping.
#[derive(Debug, Clone)]
pub struct Image {
    nx: usize,
    ny: usize,
    nz: usize,
    dx: f64,
    dy: f64,
    dz: f64,
    affine: Matrix4<f64>,
    inv_affine: Matrix4<f64>,
    /// Voxel data in Fortran order.
    pub data: Vec<f64>,
}

impl Image {
    /// Create a zero-filled image from dimensions, voxel sizes and a
    /// row-major 4x4 index-to-world affine.
    pub fn new(dims: (usize, usize, usize), voxel_size: (f64, f64, f64), affine: &[f64; 16]) -> Self {
        let m = Matrix4::from_row_slice(affine);
        let inv = m.try_inverse().unwrap_or_else(Matrix4::identity);
        Self {
            nx: dims.0,
            ny: dims.1,
            nz: dims.2,
            dx: voxel_size.0,
            dy: voxel_size.1,
            dz: voxel_size.2,
            affine: m,
            inv_affine: inv,
            data: vec![0.0; dims.0 * dims.1 * dims.2],
        }
    }

    /// Create an image that owns the given data buffer.
    pub fn from_data(
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: &[f64; 16],
        data: Vec<f64>,
    ) -> Result<Self> {
        if data.len() != dims.0 * dims.1 * dims.2 {
            return Err(ReconError::dimension_mismatch(format!(
                "data length {} does not match {}x{}x{}",
                data.len(),
                dims.0,
                dims.1,
                dims.2
            )));
        }
        let mut img = Self::new(dims, voxel_size, affine);
        img.data = data;
        Ok(img)
    }

    /// Zero-filled image on the same grid as `other`.
    pub fn zeros_like(other: &Image) -> Self {
        let mut img = other.clone();
        img.data.iter_mut().for_each(|v| *v = 0.0);
        img
    }

    /// Constant-filled image on the same grid as `other`.
    pub fn filled_like(other: &Image, value: f64) -> Self {
        let mut img = other.clone();
        img.data.iter_mut().for_each(|v| *v = value);
        img
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.nx, self.ny, self.nz)
    }

    pub fn voxel_size(&self) -> (f64, f64, f64) {
        (self.dx, self.dy, self.dz)
    }

    /// Total number of voxels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the grid spacing is the same along all three axes.
    pub fn is_isotropic(&self) -> bool {
        (self.dx - self.dy).abs() < 1e-6 && (self.dx - self.dz).abs() < 1e-6
    }

    #[inline(always)]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        idx3d(i, j, k, self.nx, self.ny)
    }

    #[inline(always)]
    pub fn at(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.idx(i, j, k)]
    }

    #[inline(always)]
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: f64) {
        let idx = self.idx(i, j, k);
        self.data[idx] = value;
    }

    /// Whether integer indices fall inside the grid.
    #[inline]
    pub fn contains(&self, i: i64, j: i64, k: i64) -> bool {
        i >= 0 && (i as usize) < self.nx && j >= 0 && (j as usize) < self.ny && k >= 0 && (k as usize) < self.nz
    }

    /// The row-major index-to-world affine.
    pub fn affine(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for r in 0..4 {
            for c in 0..4 {
                out[r * 4 + c] = self.affine[(r, c)];
            }
        }
        out
    }

    pub fn affine_matrix(&self) -> &Matrix4<f64> {
        &self.affine
    }

    /// Replace the affine (keeps the data buffer).
    pub fn set_affine(&mut self, affine: Matrix4<f64>) {
        self.inv_affine = affine.try_inverse().unwrap_or_else(Matrix4::identity);
        self.affine = affine;
    }

    /// World coordinate of a continuous voxel index.
    #[inline]
    pub fn image_to_world(&self, idx: [f64; 3]) -> [f64; 3] {
        let p = self.affine * Vector4::new(idx[0], idx[1], idx[2], 1.0);
        [p[0], p[1], p[2]]
    }

    /// Continuous voxel index of a world coordinate.
    #[inline]
    pub fn world_to_image(&self, world: [f64; 3]) -> [f64; 3] {
        let p = self.inv_affine * Vector4::new(world[0], world[1], world[2], 1.0);
        [p[0], p[1], p[2]]
    }

    /// Unit direction of an image axis (0, 1 or 2) in world space.
    pub fn axis_direction(&self, axis: usize) -> [f64; 3] {
        let col = self.affine.column(axis);
        let norm = (col[0] * col[0] + col[1] * col[1] + col[2] * col[2]).sqrt();
        if norm > 0.0 {
            [col[0] / norm, col[1] / norm, col[2] / norm]
        } else {
            [0.0, 0.0, 0.0]
        }
    }

    /// World coordinate of the grid centre.
    pub fn centre_world(&self) -> [f64; 3] {
        self.image_to_world([
            (self.nx as f64 - 1.0) / 2.0,
            (self.ny as f64 - 1.0) / 2.0,
            (self.nz as f64 - 1.0) / 2.0,
        ])
    }

    /// Extract slice `k` as a standalone 2D image whose z spacing is set
    /// to the acquired slice thickness. The world position of in-plane
    /// pixels is preserved; the through-plane axis keeps the stack
    /// direction but is rescaled to `thickness`.
    pub fn extract_slice(&self, k: usize, thickness: f64) -> Image {
        let mut affine = self.affine;
        let origin = self.affine * Vector4::new(0.0, 0.0, k as f64, 1.0);
        affine.set_column(3, &origin);
        let uz = self.axis_direction(2);
        affine[(0, 2)] = uz[0] * thickness;
        affine[(1, 2)] = uz[1] * thickness;
        affine[(2, 2)] = uz[2] * thickness;

        let mut slice = Image::new((self.nx, self.ny, 1), (self.dx, self.dy, thickness), &[0.0; 16]);
        slice.set_affine(affine);
        for j in 0..self.ny {
            for i in 0..self.nx {
                slice.data[idx3d(i, j, 0, self.nx, self.ny)] = self.at(i, j, k);
            }
        }
        slice
    }

    /// Minimum and maximum over all voxels.
    pub fn min_max(&self) -> (f64, f64) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in &self.data {
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
        }
        (lo, hi)
    }

    /// Set voxels where `mask` is zero to `padding`. The mask must share
    /// the grid.
    pub fn mask_with(&mut self, mask: &Image, padding: f64) -> Result<()> {
        if mask.len() != self.len() {
            return Err(ReconError::dimension_mismatch(
                "cannot mask the image, the mask is on a different grid".to_string(),
            ));
        }
        for (v, &m) in self.data.iter_mut().zip(mask.data.iter()) {
            if m == 0.0 {
                *v = padding;
            }
        }
        Ok(())
    }

    /// Binarise in place: values above 0.5 become 1, the rest 0.
    pub fn binarise(&mut self) {
        for v in self.data.iter_mut() {
            *v = if *v > 0.5 { 1.0 } else { 0.0 };
        }
    }

    /// Normalise to a unit maximum and threshold: values above `threshold`
    /// become 1, the rest 0.
    pub fn threshold_normalised(&mut self, threshold: f64) {
        let (_, hi) = self.min_max();
        if hi > 0.0 {
            for v in self.data.iter_mut() {
                *v /= hi;
            }
        }
        for v in self.data.iter_mut() {
            *v = if *v > threshold { 1.0 } else { 0.0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_affine(spacing: f64) -> [f64; 16] {
        [
            spacing, 0.0, 0.0, 0.0,
            0.0, spacing, 0.0, 0.0,
            0.0, 0.0, spacing, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    #[test]
    fn test_world_mapping_roundtrip() {
        let affine = [
            0.0, -2.0, 0.0, 10.0,
            2.0, 0.0, 0.0, -5.0,
            0.0, 0.0, 3.0, 7.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let img = Image::new((4, 5, 6), (2.0, 2.0, 3.0), &affine);
        let w = img.image_to_world([1.0, 2.0, 3.0]);
        let back = img.world_to_image(w);
        for (a, b) in back.iter().zip([1.0, 2.0, 3.0].iter()) {
            assert!((a - b).abs() < 1e-10, "roundtrip mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_extract_slice_preserves_world_position() {
        let mut stack = Image::new((3, 3, 4), (1.0, 1.0, 2.0), &[
            1.0, 0.0, 0.0, 5.0,
            0.0, 1.0, 0.0, -3.0,
            0.0, 0.0, 2.0, 1.0,
            0.0, 0.0, 0.0, 1.0,
        ]);
        stack.set(1, 2, 2, 42.0);
        let slice = stack.extract_slice(2, 4.5);
        assert_eq!(slice.dims(), (3, 3, 1));
        assert_eq!(slice.at(1, 2, 0), 42.0);
        assert!((slice.voxel_size().2 - 4.5).abs() < 1e-12);

        let from_stack = stack.image_to_world([1.0, 2.0, 2.0]);
        let from_slice = slice.image_to_world([1.0, 2.0, 0.0]);
        for (a, b) in from_stack.iter().zip(from_slice.iter()) {
            assert!((a - b).abs() < 1e-10, "slice plane moved: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_binarise_idempotent() {
        let mut img = Image::new((2, 2, 2), (1.0, 1.0, 1.0), &identity_affine(1.0));
        img.data = vec![0.0, 0.3, 0.7, 1.0, 0.5, 0.51, 2.0, -1.0];
        img.binarise();
        let once = img.data.clone();
        img.binarise();
        assert_eq!(img.data, once, "binarise should be idempotent");
        for &v in &img.data {
            assert!(v == 0.0 || v == 1.0);
        }
    }

    #[test]
    fn test_threshold_normalised_on_binary_is_identity() {
        let mut img = Image::new((2, 2, 1), (1.0, 1.0, 1.0), &identity_affine(1.0));
        img.data = vec![0.0, 1.0, 1.0, 0.0];
        let before = img.data.clone();
        img.threshold_normalised(0.5);
        assert_eq!(img.data, before);
    }

    #[test]
    fn test_mask_with_padding() {
        let mut img = Image::new((2, 1, 1), (1.0, 1.0, 1.0), &identity_affine(1.0));
        img.data = vec![3.0, 4.0];
        let mut mask = Image::zeros_like(&img);
        mask.data = vec![1.0, 0.0];
        img.mask_with(&mask, PADDING).unwrap();
        assert_eq!(img.data, vec![3.0, -1.0]);
    }
}
