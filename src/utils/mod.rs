//! Shared image-processing utilities

pub mod blur;
pub mod resample;

pub use blur::{gaussian_blur, gaussian_blur_with_padding};
pub use resample::{
    enlarge_z, resample_fill, resample_isotropic_padded, sample_linear_padded, sample_nearest,
};
