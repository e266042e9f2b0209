//! Separable Gaussian smoothing
//!
//! Blurring runs one axis at a time with a truncated, renormalised
//! Gaussian kernel. Sigma is given in millimetres and converted to voxels
//! per axis, so anisotropic grids smooth isotropically in world space.
//! The padding-aware variant excludes padding voxels from every window
//! and renormalises, which keeps masked regions from bleeding into the
//! foreground.

use crate::image::{idx3d, Image};

/// 1D Gaussian kernel with radius 3 sigma, normalised to unit sum.
fn gaussian_kernel(sigma_vox: f64) -> Vec<f64> {
    let radius = (3.0 * sigma_vox).ceil().max(1.0) as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let denom = 2.0 * sigma_vox * sigma_vox;
    for o in -(radius as i64)..=(radius as i64) {
        kernel.push((-(o * o) as f64 / denom).exp());
    }
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

fn blur_axis(img: &mut Image, axis: usize, sigma_mm: f64, padding: Option<f64>) {
    let (nx, ny, nz) = img.dims();
    let (dx, dy, dz) = img.voxel_size();
    let (n, d) = match axis {
        0 => (nx, dx),
        1 => (ny, dy),
        _ => (nz, dz),
    };
    let sigma_vox = sigma_mm / d;
    if n < 2 || sigma_vox < 1e-3 {
        return;
    }
    let kernel = gaussian_kernel(sigma_vox);
    let radius = kernel.len() / 2;

    let mut line = vec![0.0; n];
    let (outer1, outer2) = match axis {
        0 => (ny, nz),
        1 => (nx, nz),
        _ => (nx, ny),
    };

    for b in 0..outer2 {
        for a in 0..outer1 {
            for t in 0..n {
                let (i, j, k) = match axis {
                    0 => (t, a, b),
                    1 => (a, t, b),
                    _ => (a, b, t),
                };
                line[t] = img.data[idx3d(i, j, k, nx, ny)];
            }
            for t in 0..n {
                let centre = line[t];
                if let Some(pad) = padding {
                    if centre == pad {
                        continue;
                    }
                }
                let mut sum = 0.0;
                let mut wsum = 0.0;
                for (ki, &w) in kernel.iter().enumerate() {
                    let s = t as i64 + ki as i64 - radius as i64;
                    if s < 0 || s as usize >= n {
                        continue;
                    }
                    let v = line[s as usize];
                    if let Some(pad) = padding {
                        if v == pad {
                            continue;
                        }
                    }
                    sum += w * v;
                    wsum += w;
                }
                let (i, j, k) = match axis {
                    0 => (t, a, b),
                    1 => (a, t, b),
                    _ => (a, b, t),
                };
                img.data[idx3d(i, j, k, nx, ny)] = if wsum > 0.0 { sum / wsum } else { centre };
            }
        }
    }
}

/// Gaussian-blur an image with sigma in mm along every axis.
pub fn gaussian_blur(img: &Image, sigma_mm: f64) -> Image {
    let mut out = img.clone();
    for axis in 0..3 {
        blur_axis(&mut out, axis, sigma_mm, None);
    }
    out
}

/// Gaussian-blur an image, treating voxels equal to `padding` as missing.
/// Padding voxels stay unchanged in the output.
pub fn gaussian_blur_with_padding(img: &Image, sigma_mm: f64, padding: f64) -> Image {
    let mut out = img.clone();
    for axis in 0..3 {
        blur_axis(&mut out, axis, sigma_mm, Some(padding));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_image(dims: (usize, usize, usize), spacing: f64) -> Image {
        let affine = [
            spacing, 0.0, 0.0, 0.0,
            0.0, spacing, 0.0, 0.0,
            0.0, 0.0, spacing, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Image::new(dims, (spacing, spacing, spacing), &affine)
    }

    #[test]
    fn test_blur_preserves_constant() {
        let mut img = flat_image((8, 8, 8), 1.0);
        img.data.iter_mut().for_each(|v| *v = 5.0);
        let out = gaussian_blur(&img, 1.5);
        for &v in &out.data {
            assert!((v - 5.0).abs() < 1e-9, "constant image changed to {}", v);
        }
    }

    #[test]
    fn test_blur_spreads_impulse() {
        let mut img = flat_image((9, 9, 9), 1.0);
        img.set(4, 4, 4, 100.0);
        let out = gaussian_blur(&img, 1.0);
        assert!(out.at(4, 4, 4) < 100.0);
        assert!(out.at(3, 4, 4) > 0.0);
        // Mass is conserved away from boundaries.
        let total: f64 = out.data.iter().sum();
        assert!((total - 100.0).abs() < 1.0, "mass drifted to {}", total);
    }

    #[test]
    fn test_padded_blur_ignores_padding() {
        let mut img = flat_image((9, 9, 1), 1.0);
        img.data.iter_mut().for_each(|v| *v = -1.0);
        for j in 3..6 {
            for i in 3..6 {
                img.set(i, j, 0, 10.0);
            }
        }
        let out = gaussian_blur_with_padding(&img, 1.0, -1.0);
        // Foreground stays at its value because all contributing
        // neighbours are either 10 or excluded.
        assert!((out.at(4, 4, 0) - 10.0).abs() < 1e-9);
        // Padding is untouched.
        assert_eq!(out.at(0, 0, 0), -1.0);
    }
}
