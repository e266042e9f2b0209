//! NIfTI file I/O
//!
//! Reads .nii / .nii.gz volumes into [`Image`] and writes them back with a
//! hand-built NIfTI-1 header. The affine comes from the sform when
//! present, otherwise falls back to a diagonal voxel-scaling matrix. Data
//! is stored as float32 on disk; gzip is auto-detected on read and chosen
//! by file extension on write.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{ReconError, Result};
use crate::image::{idx3d, Image};

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Affine from the header: sform when set, else diagonal voxel scaling.
fn affine_from_header(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Load a 3D NIfTI image from bytes (.nii or .nii.gz).
pub fn load_image(bytes: &[u8]) -> Result<Image> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder)
            .map_err(|e| ReconError::io(format!("failed to read gzipped NIfTI: {}", e)))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| ReconError::io(format!("failed to read NIfTI: {}", e)))?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(ReconError::io(format!(
            "expected at least a 3D volume, got {}D",
            ndim
        )));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = affine_from_header(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| ReconError::io(format!("failed to convert volume: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(ReconError::io(format!(
            "expected at least a 3D array, got {}D",
            shape.len()
        )));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);

    // Flatten to Fortran order (x fastest); a trailing time axis is
    // reduced to its first volume.
    let array = array.into_dyn();
    let mut data = vec![0.0; nx * ny * nz];
    if shape.len() == 3 {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data[idx3d(i, j, k, nx, ny)] = scl_slope * array[[i, j, k]] + scl_inter;
                }
            }
        }
    } else {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data[idx3d(i, j, k, nx, ny)] = scl_slope * array[[i, j, k, 0]] + scl_inter;
                }
            }
        }
    }

    Image::from_data((nx, ny, nz), voxel_size, &affine, data)
}

/// Serialise an image to uncompressed NIfTI-1 bytes.
pub fn save_image(img: &Image) -> Result<Vec<u8>> {
    use std::io::Write;

    let (nx, ny, nz) = img.dims();
    let (vsx, vsy, vsz) = img.voxel_size();
    let affine = img.affine();

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4-byte extension marker)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    // scl_slope = 1, scl_inter = 0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for r in 0..3 {
        for c in 0..4 {
            let offset = 280 + r * 16 + c * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[r * 4 + c] as f32).to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + img.len() * 4);
    buffer
        .write_all(&header)
        .map_err(|e| ReconError::io(format!("write header failed: {}", e)))?;
    buffer
        .write_all(&[0u8; 4])
        .map_err(|e| ReconError::io(format!("write extension failed: {}", e)))?;
    for &val in &img.data {
        buffer
            .write_all(&(val as f32).to_le_bytes())
            .map_err(|e| ReconError::io(format!("write data failed: {}", e)))?;
    }
    Ok(buffer)
}

/// Serialise an image to gzipped NIfTI bytes.
pub fn save_image_gz(img: &Image) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_image(img)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| ReconError::io(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| ReconError::io(format!("gzip finish failed: {}", e)))
}

/// Read an image from a filesystem path (.nii or .nii.gz).
pub fn read_image_file(path: &Path) -> Result<Image> {
    let bytes = std::fs::read(path)
        .map_err(|e| ReconError::io(format!("failed to read '{}': {}", path.display(), e)))?;
    load_image(&bytes)
}

/// Write an image to a file; gzip when the path ends with .nii.gz.
pub fn save_image_file(path: &Path, img: &Image) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_image_gz(img)?
    } else {
        save_image(img)?
    };
    std::fs::write(path, &bytes)
        .map_err(|e| ReconError::io(format!("failed to write '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_affine_fallback_without_sform() {
        let mut header = NiftiHeader::default();
        header.pixdim[1] = 1.0;
        header.pixdim[2] = 2.0;
        header.pixdim[3] = 3.0;
        header.sform_code = 0;

        let affine = affine_from_header(&header);
        assert_eq!(affine[0], 1.0);
        assert_eq!(affine[5], 2.0);
        assert_eq!(affine[10], 3.0);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let affine = [
            1.0, 0.0, 0.0, 10.0,
            0.0, 2.0, 0.0, 20.0,
            0.0, 0.0, 3.0, 30.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let n = 4 * 4 * 4;
        let data: Vec<f64> = (0..n).map(|i| (i as f32 * 0.5 + 1.0) as f64).collect();
        let img = Image::from_data((4, 4, 4), (1.0, 2.0, 3.0), &affine, data.clone()).unwrap();

        let bytes = save_image(&img).unwrap();
        assert_eq!(&bytes[344..348], b"n+1\0");

        let loaded = load_image(&bytes).unwrap();
        assert_eq!(loaded.dims(), (4, 4, 4));
        let (vsx, vsy, vsz) = loaded.voxel_size();
        assert!((vsx - 1.0).abs() < 1e-5);
        assert!((vsy - 2.0).abs() < 1e-5);
        assert!((vsz - 3.0).abs() < 1e-5);
        for i in 0..n {
            assert!(
                (loaded.data[i] - data[i]).abs() < 1e-5,
                "data mismatch at {}: {} vs {}",
                i,
                loaded.data[i],
                data[i]
            );
        }
        let la = loaded.affine();
        assert!((la[3] - 10.0).abs() < 1e-5);
        assert!((la[7] - 20.0).abs() < 1e-5);
    }

    #[test]
    fn test_gz_roundtrip() {
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let data: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let img = Image::from_data((2, 2, 2), (1.0, 1.0, 1.0), &affine, data.clone()).unwrap();
        let bytes = save_image_gz(&img).unwrap();
        assert!(is_gzip(&bytes));
        let loaded = load_image(&bytes).unwrap();
        assert_eq!(loaded.data, data);
    }
}
