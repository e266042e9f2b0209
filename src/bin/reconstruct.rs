//! Minimal reconstruction driver
//!
//! Usage: reconstruct <output.nii.gz> <N> <stack1.nii.gz> .. <stackN.nii.gz>
//!        [--mask mask.nii.gz] [--thickness t1 .. tN] [--resolution mm]
//!        [--iterations n] [--sr-iterations n] [--no-intensity-matching]
//!        [--no-bias] [--structural] [--ffd] [--exclude i ..]

use std::path::{Path, PathBuf};
use std::time::Instant;

use svr_core::nifti_io::{read_image_file, save_image_file};
use svr_core::{Image, ReconParams, Reconstruction, RigidTransform};

fn parse_args() -> Result<(PathBuf, Vec<PathBuf>, Option<PathBuf>, Vec<f64>, ReconParams), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        return Err(
            "usage: reconstruct <output> <N> <stack..> [--mask m] [--thickness t..] \
             [--resolution mm] [--iterations n] [--sr-iterations n] \
             [--no-intensity-matching] [--no-bias] [--structural] [--ffd] [--exclude i..]"
                .to_string(),
        );
    }

    let output = PathBuf::from(&args[0]);
    let n: usize = args[1].parse().map_err(|_| "invalid stack count".to_string())?;
    if args.len() < 2 + n {
        return Err(format!("expected {} stack paths", n));
    }
    let stacks: Vec<PathBuf> = args[2..2 + n].iter().map(PathBuf::from).collect();

    let mut mask = None;
    let mut thickness = Vec::new();
    let mut params = ReconParams::default();

    let mut i = 2 + n;
    while i < args.len() {
        match args[i].as_str() {
            "--mask" => {
                mask = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--thickness" => {
                thickness = args[i + 1..i + 1 + n]
                    .iter()
                    .map(|t| t.parse().map_err(|_| "invalid thickness".to_string()))
                    .collect::<Result<_, _>>()?;
                i += 1 + n;
            }
            "--resolution" => {
                params.resolution = args[i + 1].parse().map_err(|_| "invalid resolution".to_string())?;
                i += 2;
            }
            "--iterations" => {
                params.outer_iterations = args[i + 1].parse().map_err(|_| "invalid iterations".to_string())?;
                i += 2;
            }
            "--sr-iterations" => {
                params.sr_iterations = args[i + 1].parse().map_err(|_| "invalid sr-iterations".to_string())?;
                i += 2;
            }
            "--no-intensity-matching" => {
                params.intensity_matching = false;
                i += 1;
            }
            "--no-bias" => {
                params.bias_correction = false;
                i += 1;
            }
            "--structural" => {
                params.structural_exclusion = true;
                i += 1;
            }
            "--ffd" => {
                params.ffd = true;
                i += 1;
            }
            "--exclude" => {
                i += 1;
                while i < args.len() && !args[i].starts_with("--") {
                    params
                        .force_excluded
                        .push(args[i].parse().map_err(|_| "invalid slice index".to_string())?);
                    i += 1;
                }
            }
            other => return Err(format!("unknown option '{}'", other)),
        }
    }

    Ok((output, stacks, mask, thickness, params))
}

fn main() -> Result<(), String> {
    env_logger::init();
    let total_start = Instant::now();

    let (output, stack_paths, mask_path, mut thickness, params) =
        parse_args().map_err(|e| e.to_string())?;

    println!("[INFO] Loading {} stacks...", stack_paths.len());
    let mut stacks: Vec<Image> = Vec::with_capacity(stack_paths.len());
    for path in &stack_paths {
        let stack = read_image_file(path).map_err(|e| e.to_string())?;
        let (nx, ny, nz) = stack.dims();
        let (dx, dy, dz) = stack.voxel_size();
        println!(
            "[INFO]   {}: {}x{}x{}, voxel {:.2}x{:.2}x{:.2} mm",
            path.display(),
            nx, ny, nz, dx, dy, dz
        );
        stacks.push(stack);
    }

    // Default slice thickness: twice the stack z spacing.
    if thickness.is_empty() {
        thickness = stacks.iter().map(|s| s.voxel_size().2 * 2.0).collect();
        println!("[INFO] Using default thickness {:?}", thickness);
    }

    let mask = match &mask_path {
        Some(p) => Some(read_image_file(p).map_err(|e| e.to_string())?),
        None => None,
    };

    let stack_transforms = vec![RigidTransform::identity(); stacks.len()];
    let resolution = params.resolution;
    let average_value = params.average_value;
    let intensity_matching = params.intensity_matching;

    let mut recon = Reconstruction::new(params);

    println!("[INFO] Creating template...");
    let d = recon
        .create_template(&stacks[0], resolution)
        .map_err(|e| e.to_string())?;
    println!("[INFO]   resolution {:.2} mm", d);

    recon
        .set_mask(mask.as_ref(), 4.0, 0.5)
        .map_err(|e| e.to_string())?;

    if intensity_matching {
        recon
            .match_stack_intensities_with_masking(&mut stacks, &stack_transforms, average_value, false)
            .map_err(|e| e.to_string())?;
    }

    recon
        .create_slices(&stacks, &stack_transforms, &thickness, None, None)
        .map_err(|e| e.to_string())?;
    recon.mask_slices();

    println!("[INFO] Reconstructing...");
    let start = Instant::now();
    recon.run().map_err(|e| e.to_string())?;
    println!("[INFO] Reconstruction finished in {:.2?}", start.elapsed());

    let report = recon.recon_quality_report();
    println!(
        "[INFO] Quality: NCC {:.4}, NRMSE {:.4}, average weight {:.4}, excluded {:.4}",
        report.ncc, report.nrmse, report.average_volume_weight, report.ratio_excluded
    );

    save_image_file(&output, recon.reconstructed()).map_err(|e| e.to_string())?;
    println!("[INFO] Wrote {}", output.display());

    recon
        .save_slice_info(Path::new("summary-slice-info.csv"))
        .map_err(|e| e.to_string())?;
    println!("[INFO] Total time {:.2?}", total_start.elapsed());
    Ok(())
}
