//! SVR-Core: slice-to-volume reconstruction for motion-corrupted MRI
//!
//! This crate reconstructs a single motion-corrected, super-resolved 3D
//! volume from several low-resolution, differently oriented 2D slice
//! stacks whose subject moved between slice acquisitions.
//!
//! # Modules
//! - `image`: flat Fortran-order image container with world mapping
//! - `transform`: rigid and free-form slice poses
//! - `psf`: Gaussian PSF forward operator (sparse coefficient arenas)
//! - `simulate`: forward projection and residuals
//! - `register`: slice-to-volume registration (local and remote)
//! - `em`: EM robust statistics (weights, scales, bias fields)
//! - `superres`: Gaussian init, SR update and adaptive regularisation
//! - `engine`: reconstruction context and outer iterator
//! - `quality`: NCC / NRMSE diagnostics
//! - `utils`: Gaussian smoothing and resampling
//! - `nifti_io`: NIfTI I/O

// Core containers
pub mod error;
pub mod image;
pub mod transform;

// Algorithm modules
pub mod em;
pub mod engine;
pub mod psf;
pub mod quality;
pub mod register;
pub mod simulate;
pub mod superres;
pub mod utils;

// I/O modules
pub mod nifti_io;

pub use engine::{invert_stack_transformations, ReconParams, Reconstruction};
pub use error::{ReconError, Result};
pub use image::Image;
pub use quality::QualityReport;
pub use transform::{FreeFormTransform, RigidTransform, SlicePose};
