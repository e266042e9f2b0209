//! Interpolation and resampling with padding
//!
//! Trilinear sampling excludes padding voxels and renormalises over the
//! remaining corners, so masked regions never leak intensity. Resampling
//! builds a new grid that keeps the source orientation and origin and
//! covers the same world extent.

use nalgebra::Matrix4;

use crate::image::Image;

/// Trilinear sample at a continuous voxel index. Corners outside the grid
/// or equal to `padding` are excluded and the remaining weights
/// renormalised; returns `padding` when nothing valid is left.
pub fn sample_linear_padded(img: &Image, idx: [f64; 3], padding: f64) -> f64 {
    let (nx, ny, nz) = img.dims();
    let fx = idx[0].floor();
    let fy = idx[1].floor();
    let fz = idx[2].floor();
    let tx = idx[0] - fx;
    let ty = idx[1] - fy;
    let tz = idx[2] - fz;

    let mut sum = 0.0;
    let mut wsum = 0.0;
    for dk in 0..2 {
        let k = fz as i64 + dk;
        if k < 0 || k as usize >= nz {
            continue;
        }
        let wz = if dk == 0 { 1.0 - tz } else { tz };
        for dj in 0..2 {
            let j = fy as i64 + dj;
            if j < 0 || j as usize >= ny {
                continue;
            }
            let wy = if dj == 0 { 1.0 - ty } else { ty };
            for di in 0..2 {
                let i = fx as i64 + di;
                if i < 0 || i as usize >= nx {
                    continue;
                }
                let wx = if di == 0 { 1.0 - tx } else { tx };
                let v = img.at(i as usize, j as usize, k as usize);
                if v == padding {
                    continue;
                }
                let w = wx * wy * wz;
                sum += w * v;
                wsum += w;
            }
        }
    }
    if wsum > 0.01 {
        sum / wsum
    } else {
        padding
    }
}

/// Nearest-neighbour sample at a continuous voxel index; `fallback` when
/// the rounded index leaves the grid.
pub fn sample_nearest(img: &Image, idx: [f64; 3], fallback: f64) -> f64 {
    let i = idx[0].round() as i64;
    let j = idx[1].round() as i64;
    let k = idx[2].round() as i64;
    if img.contains(i, j, k) {
        img.at(i as usize, j as usize, k as usize)
    } else {
        fallback
    }
}

/// Resample onto an isotropic grid with spacing `d`, preserving the
/// source orientation and origin. Voxels with no valid support become
/// `padding`.
pub fn resample_isotropic_padded(img: &Image, d: f64, padding: f64) -> Image {
    let (nx, ny, nz) = img.dims();
    let (dx, dy, dz) = img.voxel_size();
    let new_dims = (
        ((nx as f64 * dx / d).round() as usize).max(1),
        ((ny as f64 * dy / d).round() as usize).max(1),
        ((nz as f64 * dz / d).round() as usize).max(1),
    );

    let mut affine = *img.affine_matrix();
    for axis in 0..3 {
        let u = img.axis_direction(axis);
        affine[(0, axis)] = u[0] * d;
        affine[(1, axis)] = u[1] * d;
        affine[(2, axis)] = u[2] * d;
    }

    let mut out = Image::new(new_dims, (d, d, d), &[0.0; 16]);
    out.set_affine(affine);
    resample_fill(img, &mut out, |w| w, false, padding);
    out
}

/// Fill `target` by sampling `src` at `map(target_world)`. `map` takes the
/// world coordinate of each target voxel into the source world frame.
/// Nearest-neighbour when `nearest`, otherwise padded trilinear.
pub fn resample_fill<F>(src: &Image, target: &mut Image, map: F, nearest: bool, padding: f64)
where
    F: Fn([f64; 3]) -> [f64; 3],
{
    let (nx, ny, nz) = target.dims();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let w = target.image_to_world([i as f64, j as f64, k as f64]);
                let s = src.world_to_image(map(w));
                let v = if nearest {
                    sample_nearest(src, s, padding)
                } else {
                    sample_linear_padded(src, s, padding)
                };
                target.set(i, j, k, v);
            }
        }
    }
}

/// Append `extra` padding-filled voxel planes along z, keeping the affine.
pub fn enlarge_z(img: &Image, extra: usize, fill: f64) -> Image {
    let (nx, ny, nz) = img.dims();
    let mut out = Image::new((nx, ny, nz + extra), img.voxel_size(), &[0.0; 16]);
    out.set_affine(Matrix4::from_row_slice(&img.affine()));
    out.data.iter_mut().for_each(|v| *v = fill);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                out.set(i, j, k, img.at(i, j, k));
            }
        }
    }
    out
}
