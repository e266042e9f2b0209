//! Registration similarity metric
//!
//! Masked NCC between a slice and the reconstruction sampled onto the
//! slice grid through a candidate pose. Padding pixels on either side
//! drop out; too little overlap scores negative infinity so the
//! optimiser never walks a slice off the volume.

use crate::image::Image;
use crate::utils::sample_linear_padded;

/// NCC between `slice` and `volume` sampled at `map(pixel world)`.
/// Returns `f64::NEG_INFINITY` when fewer than 16 pixels overlap.
pub fn pose_similarity<F>(slice: &Image, volume: &Image, map: F) -> f64
where
    F: Fn([f64; 3]) -> [f64; 3],
{
    let (nx, ny, _) = slice.dims();
    let mut n = 0usize;
    let mut sum_s = 0.0;
    let mut sum_v = 0.0;
    let mut sum_sv = 0.0;
    let mut sum_ss = 0.0;
    let mut sum_vv = 0.0;

    for j in 0..ny {
        for i in 0..nx {
            let s = slice.at(i, j, 0);
            if s <= -0.01 {
                continue;
            }
            let w = map(slice.image_to_world([i as f64, j as f64, 0.0]));
            let c = volume.world_to_image(w);
            let v = sample_linear_padded(volume, c, -1.0);
            if v <= -0.01 {
                continue;
            }
            n += 1;
            sum_s += s;
            sum_v += v;
            sum_sv += s * v;
            sum_ss += s * s;
            sum_vv += v * v;
        }
    }

    if n < 16 {
        return f64::NEG_INFINITY;
    }
    let nf = n as f64;
    let cov = sum_sv - sum_s * sum_v / nf;
    let var_s = sum_ss - sum_s * sum_s / nf;
    let var_v = sum_vv - sum_v * sum_v / nf;
    if var_s * var_v > 0.0 {
        cov / (var_s * var_v).sqrt()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RigidTransform;

    fn gradient_volume(n: usize) -> Image {
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let mut img = Image::new((n, n, n), (1.0, 1.0, 1.0), &affine);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    img.set(i, j, k, (i + 2 * j + 3 * k) as f64 + 1.0);
                }
            }
        }
        img
    }

    #[test]
    fn test_aligned_slice_scores_one() {
        let volume = gradient_volume(12);
        let slice = volume.extract_slice(6, 1.0);
        let pose = RigidTransform::identity();
        let ncc = pose_similarity(&slice, &volume, |p| pose.transform_point(p));
        assert!(ncc > 0.999, "aligned slice should score ~1, got {}", ncc);
    }

    #[test]
    fn test_misaligned_slice_scores_lower() {
        let volume = gradient_volume(12);
        let slice = volume.extract_slice(6, 1.0);
        let good = pose_similarity(&slice, &volume, |p| p);
        let bad_pose = RigidTransform::from_params([0.0, 0.0, 0.0, 0.3, 0.0, 0.0]);
        let bad = pose_similarity(&slice, &volume, |p| bad_pose.transform_point(p));
        assert!(bad < good, "rotated pose should score below identity");
    }

    #[test]
    fn test_no_overlap_is_minus_infinity() {
        let volume = gradient_volume(8);
        let slice = volume.extract_slice(4, 1.0);
        let away = RigidTransform::from_params([500.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let ncc = pose_similarity(&slice, &volume, |p| away.transform_point(p));
        assert_eq!(ncc, f64::NEG_INFINITY);
    }
}
