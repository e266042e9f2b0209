//! Rigid and free-form slice poses
//!
//! A slice pose maps slice world coordinates into reconstruction world
//! coordinates. Two kinds exist: a 6-DOF rigid transform (rotation about
//! the world origin plus translation, ZYX Euler convention) and a
//! free-form deformation that composes a rigid part with a cubic B-spline
//! displacement grid. The pose kind is a tagged enum; every consumer goes
//! through the common `transform_point` capability.

use std::fmt::Write as _;
use std::path::Path;

use nalgebra::{Matrix4, Vector4};

use crate::error::{ReconError, Result};
use crate::image::Image;

/// Rigid transform: T(x) = R x + t with R = Rz * Ry * Rx.
#[derive(Debug, Clone)]
pub struct RigidTransform {
    /// (tx, ty, tz) in mm, (rx, ry, rz) in radians.
    params: [f64; 6],
    matrix: Matrix4<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            params: [0.0; 6],
            matrix: Matrix4::identity(),
        }
    }

    /// Build from (tx, ty, tz, rx, ry, rz); rotations in radians.
    pub fn from_params(params: [f64; 6]) -> Self {
        let mut t = Self {
            params,
            matrix: Matrix4::identity(),
        };
        t.update_matrix();
        t
    }

    /// Build from a homogeneous matrix, recovering the 6 parameters by
    /// ZYX Euler decomposition of the rotation block.
    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        let ry = (-m[(2, 0)]).asin();
        let (rx, rz) = if ry.cos().abs() > 1e-9 {
            (m[(2, 1)].atan2(m[(2, 2)]), m[(1, 0)].atan2(m[(0, 0)]))
        } else {
            // Gimbal lock: fold everything into rx.
            ((-m[(1, 2)]).atan2(m[(1, 1)]), 0.0)
        };
        Self {
            params: [m[(0, 3)], m[(1, 3)], m[(2, 3)], rx, ry, rz],
            matrix: m,
        }
    }

    pub fn params(&self) -> [f64; 6] {
        self.params
    }

    pub fn translation(&self) -> [f64; 3] {
        [self.params[0], self.params[1], self.params[2]]
    }

    /// Rotations in radians.
    pub fn rotation(&self) -> [f64; 3] {
        [self.params[3], self.params[4], self.params[5]]
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    fn update_matrix(&mut self) {
        let [tx, ty, tz, rx, ry, rz] = self.params;
        let (cx, sx) = (rx.cos(), rx.sin());
        let (cy, sy) = (ry.cos(), ry.sin());
        let (cz, sz) = (rz.cos(), rz.sin());

        // R = Rz * Ry * Rx
        let mut m = Matrix4::identity();
        m[(0, 0)] = cz * cy;
        m[(0, 1)] = cz * sy * sx - sz * cx;
        m[(0, 2)] = cz * sy * cx + sz * sx;
        m[(1, 0)] = sz * cy;
        m[(1, 1)] = sz * sy * sx + cz * cx;
        m[(1, 2)] = sz * sy * cx - cz * sx;
        m[(2, 0)] = -sy;
        m[(2, 1)] = cy * sx;
        m[(2, 2)] = cy * cx;
        m[(0, 3)] = tx;
        m[(1, 3)] = ty;
        m[(2, 3)] = tz;
        self.matrix = m;
    }

    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let q = self.matrix * Vector4::new(p[0], p[1], p[2], 1.0);
        [q[0], q[1], q[2]]
    }

    /// Compose: self applied after `other`.
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform::from_matrix(self.matrix * other.matrix)
    }

    /// Invert in place, keeping parameters in sync with the matrix.
    pub fn invert(&mut self) {
        let inv = self
            .matrix
            .try_inverse()
            .unwrap_or_else(Matrix4::identity);
        *self = RigidTransform::from_matrix(inv);
    }

    /// Serialise to a small text .dof file: 6 parameters and the matrix.
    pub fn write_dof(&self, path: &Path) -> Result<()> {
        let mut out = String::from("dof-rigid 1\n");
        let p = self.params;
        writeln!(
            out,
            "{:.12} {:.12} {:.12} {:.12} {:.12} {:.12}",
            p[0], p[1], p[2], p[3], p[4], p[5]
        )
        .ok();
        for r in 0..4 {
            writeln!(
                out,
                "{:.12} {:.12} {:.12} {:.12}",
                self.matrix[(r, 0)],
                self.matrix[(r, 1)],
                self.matrix[(r, 2)],
                self.matrix[(r, 3)]
            )
            .ok();
        }
        std::fs::write(path, out)
            .map_err(|e| ReconError::io(format!("failed to write '{}': {}", path.display(), e)))
    }

    /// Read a text .dof file written by `write_dof`.
    pub fn read_dof(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReconError::io(format!("failed to read '{}': {}", path.display(), e)))?;
        let mut lines = text.lines();
        let header = lines.next().unwrap_or("");
        if !header.starts_with("dof-rigid") {
            return Err(ReconError::io(format!(
                "'{}' is not a rigid .dof file",
                path.display()
            )));
        }
        let params_line = lines
            .next()
            .ok_or_else(|| ReconError::io(format!("'{}' is truncated", path.display())))?;
        let vals: Vec<f64> = params_line
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        if vals.len() != 6 {
            return Err(ReconError::io(format!(
                "'{}' has {} parameters, expected 6",
                path.display(),
                vals.len()
            )));
        }
        Ok(Self::from_params([
            vals[0], vals[1], vals[2], vals[3], vals[4], vals[5],
        ]))
    }
}

/// Cubic B-spline basis functions B0..B3 at parameter t in [0, 1).
#[inline]
fn bspline_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        (1.0 - t).powi(3) / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Free-form deformation: a rigid part followed by a cubic B-spline
/// displacement field on a regular control-point grid in world space.
#[derive(Debug, Clone)]
pub struct FreeFormTransform {
    rigid: RigidTransform,
    origin: [f64; 3],
    spacing: f64,
    dims: [usize; 3],
    disp: Vec<[f64; 3]>,
}

impl FreeFormTransform {
    /// Identity FFD whose control grid covers the world bounding box of
    /// `slice` with a margin of two control spacings on every side.
    pub fn for_slice(slice: &Image, spacing: f64) -> Self {
        let (nx, ny, _) = slice.dims();
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for &corner in &[
            [0.0, 0.0, 0.0],
            [nx as f64 - 1.0, 0.0, 0.0],
            [0.0, ny as f64 - 1.0, 0.0],
            [nx as f64 - 1.0, ny as f64 - 1.0, 0.0],
        ] {
            let w = slice.image_to_world(corner);
            for a in 0..3 {
                lo[a] = lo[a].min(w[a]);
                hi[a] = hi[a].max(w[a]);
            }
        }
        let mut origin = [0.0; 3];
        let mut dims = [0usize; 3];
        for a in 0..3 {
            origin[a] = lo[a] - 2.0 * spacing;
            dims[a] = ((hi[a] - lo[a]) / spacing).ceil() as usize + 5;
        }
        Self {
            rigid: RigidTransform::identity(),
            origin,
            spacing,
            dims,
            disp: vec![[0.0; 3]; dims[0] * dims[1] * dims[2]],
        }
    }

    pub fn rigid(&self) -> &RigidTransform {
        &self.rigid
    }

    pub fn set_rigid(&mut self, rigid: RigidTransform) {
        self.rigid = rigid;
    }

    pub fn control_dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn control_spacing(&self) -> f64 {
        self.spacing
    }

    #[inline]
    fn control_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims[0] + k * self.dims[0] * self.dims[1]
    }

    pub fn displacement_at(&self, i: usize, j: usize, k: usize) -> [f64; 3] {
        self.disp[self.control_index(i, j, k)]
    }

    pub fn set_displacement(&mut self, i: usize, j: usize, k: usize, d: [f64; 3]) {
        let idx = self.control_index(i, j, k);
        self.disp[idx] = d;
    }

    /// B-spline interpolated displacement at a world point (after the
    /// rigid part has been applied).
    fn local_displacement(&self, p: [f64; 3]) -> [f64; 3] {
        let mut u = [0.0; 3];
        let mut base = [0i64; 3];
        let mut w = [[0.0; 4]; 3];
        for a in 0..3 {
            u[a] = (p[a] - self.origin[a]) / self.spacing;
            let fl = u[a].floor();
            base[a] = fl as i64 - 1;
            w[a] = bspline_weights(u[a] - fl);
        }
        let mut out = [0.0; 3];
        for kk in 0..4 {
            let cz = base[2] + kk as i64;
            if cz < 0 || cz as usize >= self.dims[2] {
                continue;
            }
            for jj in 0..4 {
                let cy = base[1] + jj as i64;
                if cy < 0 || cy as usize >= self.dims[1] {
                    continue;
                }
                for ii in 0..4 {
                    let cx = base[0] + ii as i64;
                    if cx < 0 || cx as usize >= self.dims[0] {
                        continue;
                    }
                    let weight = w[0][ii] * w[1][jj] * w[2][kk];
                    let d = self.disp[self.control_index(cx as usize, cy as usize, cz as usize)];
                    out[0] += weight * d[0];
                    out[1] += weight * d[1];
                    out[2] += weight * d[2];
                }
            }
        }
        out
    }

    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let q = self.rigid.transform_point(p);
        let d = self.local_displacement(q);
        [q[0] + d[0], q[1] + d[1], q[2] + d[2]]
    }

    /// Serialise to a text .dof file: rigid parameters, grid layout, then
    /// one displacement triple per control point.
    pub fn write_dof(&self, path: &Path) -> Result<()> {
        let mut out = String::from("dof-ffd 1\n");
        let p = self.rigid.params();
        writeln!(
            out,
            "{:.12} {:.12} {:.12} {:.12} {:.12} {:.12}",
            p[0], p[1], p[2], p[3], p[4], p[5]
        )
        .ok();
        writeln!(
            out,
            "{} {} {} {:.12} {:.12} {:.12} {:.12}",
            self.dims[0], self.dims[1], self.dims[2], self.spacing, self.origin[0], self.origin[1], self.origin[2]
        )
        .ok();
        for d in &self.disp {
            writeln!(out, "{:.12} {:.12} {:.12}", d[0], d[1], d[2]).ok();
        }
        std::fs::write(path, out)
            .map_err(|e| ReconError::io(format!("failed to write '{}': {}", path.display(), e)))
    }

    /// Read a text .dof file written by `write_dof`.
    pub fn read_dof(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReconError::io(format!("failed to read '{}': {}", path.display(), e)))?;
        let mut lines = text.lines();
        let header = lines.next().unwrap_or("");
        if !header.starts_with("dof-ffd") {
            return Err(ReconError::io(format!(
                "'{}' is not an FFD .dof file",
                path.display()
            )));
        }
        let parse_line = |line: Option<&str>| -> Result<Vec<f64>> {
            line.map(|l| {
                l.split_whitespace()
                    .filter_map(|t| t.parse().ok())
                    .collect::<Vec<f64>>()
            })
            .ok_or_else(|| ReconError::io(format!("'{}' is truncated", path.display())))
        };
        let rp = parse_line(lines.next())?;
        let grid = parse_line(lines.next())?;
        if rp.len() != 6 || grid.len() != 7 {
            return Err(ReconError::io(format!(
                "'{}' has a malformed FFD header",
                path.display()
            )));
        }
        let dims = [grid[0] as usize, grid[1] as usize, grid[2] as usize];
        let mut ffd = Self {
            rigid: RigidTransform::from_params([rp[0], rp[1], rp[2], rp[3], rp[4], rp[5]]),
            origin: [grid[4], grid[5], grid[6]],
            spacing: grid[3],
            dims,
            disp: Vec::with_capacity(dims[0] * dims[1] * dims[2]),
        };
        for line in lines {
            let d: Vec<f64> = line
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if d.len() == 3 {
                ffd.disp.push([d[0], d[1], d[2]]);
            }
        }
        if ffd.disp.len() != dims[0] * dims[1] * dims[2] {
            return Err(ReconError::io(format!(
                "'{}' has {} control points, expected {}",
                path.display(),
                ffd.disp.len(),
                dims[0] * dims[1] * dims[2]
            )));
        }
        Ok(ffd)
    }
}

/// Per-slice pose, polymorphic over the transform kind.
#[derive(Debug, Clone)]
pub enum SlicePose {
    Rigid(RigidTransform),
    FreeForm(FreeFormTransform),
}

impl SlicePose {
    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        match self {
            SlicePose::Rigid(t) => t.transform_point(p),
            SlicePose::FreeForm(t) => t.transform_point(p),
        }
    }

    /// The rigid component of the pose.
    pub fn rigid(&self) -> &RigidTransform {
        match self {
            SlicePose::Rigid(t) => t,
            SlicePose::FreeForm(t) => t.rigid(),
        }
    }

    pub fn write_dof(&self, path: &Path) -> Result<()> {
        match self {
            SlicePose::Rigid(t) => t.write_dof(path),
            SlicePose::FreeForm(t) => t.write_dof(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = RigidTransform::identity();
        let p = t.transform_point([1.0, 2.0, 3.0]);
        assert_eq!(p, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_params_matrix_roundtrip() {
        let params = [3.0, -2.0, 1.5, 0.2, -0.4, 0.9];
        let t = RigidTransform::from_params(params);
        let t2 = RigidTransform::from_matrix(*t.matrix());
        for (a, b) in t2.params().iter().zip(params.iter()) {
            assert!((a - b).abs() < 1e-10, "param mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_invert_twice_is_identity() {
        let mut t = RigidTransform::from_params([5.0, -7.0, 2.0, 0.3, 0.1, -0.5]);
        let orig = t.params();
        t.invert();
        t.invert();
        for (a, b) in t.params().iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-9, "double inversion drifted: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = RigidTransform::from_params([1.0, 0.0, 0.0, 0.0, 0.0, 0.5]);
        let b = RigidTransform::from_params([0.0, 2.0, 0.0, 0.3, 0.0, 0.0]);
        let p = [1.0, -2.0, 0.5];
        let seq = a.transform_point(b.transform_point(p));
        let composed = a.compose(&b).transform_point(p);
        for (x, y) in seq.iter().zip(composed.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bspline_weights_partition_of_unity() {
        for &t in &[0.0, 0.25, 0.5, 0.99] {
            let w = bspline_weights(t);
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "weights at t={} sum to {}", t, sum);
        }
    }

    #[test]
    fn test_ffd_identity_is_identity() {
        let slice = Image::new((8, 8, 1), (1.0, 1.0, 3.0), &[
            1.0, 0.0, 0.0, -4.0,
            0.0, 1.0, 0.0, -4.0,
            0.0, 0.0, 3.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]);
        let ffd = FreeFormTransform::for_slice(&slice, 5.0);
        let p = ffd.transform_point([1.0, 2.0, 0.0]);
        for (a, b) in p.iter().zip([1.0, 2.0, 0.0].iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dof_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("svr_core_test_rigid.dof");
        let t = RigidTransform::from_params([1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
        t.write_dof(&path).unwrap();
        let back = RigidTransform::read_dof(&path).unwrap();
        for (a, b) in back.params().iter().zip(t.params().iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        std::fs::remove_file(&path).ok();
    }
}
