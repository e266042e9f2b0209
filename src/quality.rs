//! Reconstruction quality metrics
//!
//! NCC and NRMSE between acquired and simulated slices, plus the summary
//! report produced at the end of each outer iteration.

use crate::image::Image;

/// Normalised cross-correlation between two images on the same grid,
/// restricted to voxels where both exceed `threshold`.
///
/// Returns -1 when fewer than 5 voxels qualify, 0 when either image is
/// constant over the overlap. The optional `count` receives the number of
/// overlapping voxels.
pub fn compute_ncc(a: &Image, b: &Image, threshold: f64, count: Option<&mut usize>) -> f64 {
    let n_vox = a.len().min(b.len());

    let mut n = 0usize;
    let mut mean_a = 0.0;
    let mut mean_b = 0.0;
    for i in 0..n_vox {
        if a.data[i] > threshold && b.data[i] > threshold {
            mean_a += a.data[i];
            mean_b += b.data[i];
            n += 1;
        }
    }
    if let Some(c) = count {
        *c = n;
    }
    if n < 5 {
        return -1.0;
    }
    mean_a /= n as f64;
    mean_b /= n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n_vox {
        if a.data[i] > threshold && b.data[i] > threshold {
            let da = a.data[i] - mean_a;
            let db = b.data[i] - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
    }
    if var_a * var_b > 0.0 {
        cov / (var_a * var_b).sqrt()
    } else {
        0.0
    }
}

/// Quality scalars reported at iteration termini.
#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    /// Mean slice-vs-simulation NCC.
    pub ncc: f64,
    /// Mean slice-vs-simulation NRMSE.
    pub nrmse: f64,
    /// Mean PSF mass per masked voxel.
    pub average_volume_weight: f64,
    /// Fraction of slices with posterior weight below 0.5.
    pub ratio_excluded: f64,
}

/// NRMSE of a scaled, bias-corrected slice against its simulation over
/// pixels where both are positive; normalised by the mean corrected
/// intensity. Returns 0 when nothing overlaps.
pub fn slice_nrmse(slice: &Image, bias: &Image, scale: f64, simulated: &Image) -> f64 {
    let mut diff2 = 0.0;
    let mut total = 0.0;
    let mut n = 0usize;
    for i in 0..slice.len() {
        if slice.data[i] > 0.0 && simulated.data[i] > 0.0 {
            let s = slice.data[i] * (-bias.data[i]).exp() * scale;
            let d = s - simulated.data[i];
            diff2 += d * d;
            total += s;
            n += 1;
        }
    }
    if n == 0 || total <= 0.0 {
        return 0.0;
    }
    (diff2 / n as f64).sqrt() / (total / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(data: Vec<f64>) -> Image {
        let n = data.len();
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Image::from_data((n, 1, 1), (1.0, 1.0, 1.0), &affine, data).unwrap()
    }

    #[test]
    fn test_ncc_identical_is_one() {
        let a = image_with(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = a.clone();
        let ncc = compute_ncc(&a, &b, 0.0, None);
        assert!((ncc - 1.0).abs() < 1e-12, "self NCC was {}", ncc);
    }

    #[test]
    fn test_ncc_anticorrelated() {
        let a = image_with(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = image_with(vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
        let ncc = compute_ncc(&a, &b, 0.0, None);
        assert!((ncc + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ncc_too_few_voxels() {
        let a = image_with(vec![1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        let b = image_with(vec![1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        let mut count = 0;
        let ncc = compute_ncc(&a, &b, 0.5, Some(&mut count));
        assert_eq!(ncc, -1.0);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_ncc_constant_overlap_is_zero() {
        let a = image_with(vec![2.0; 8]);
        let b = image_with(vec![3.0; 8]);
        assert_eq!(compute_ncc(&a, &b, 0.0, None), 0.0);
    }

    #[test]
    fn test_slice_nrmse_perfect_agreement() {
        let s = image_with(vec![2.0, 4.0, 6.0, 8.0]);
        let bias = image_with(vec![0.0; 4]);
        let sim = s.clone();
        let v = slice_nrmse(&s, &bias, 1.0, &sim);
        assert!(v.abs() < 1e-12, "perfect agreement gave {}", v);
    }
}
