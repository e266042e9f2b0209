//! End-to-end reconstruction scenarios

mod common;

use common::{axial_stack, blob_phantom, correlation, nrmse, sagittal_stack, Lcg};
use svr_core::{ReconError, ReconParams, Reconstruction, RigidTransform};

/// Mask of phantom voxels carrying signal.
fn signal_mask(data: &[f64], threshold: f64) -> Vec<u8> {
    data.iter().map(|&v| if v > threshold { 1 } else { 0 }).collect()
}

#[test]
fn single_stack_identity_poses_reproduces_the_stack() {
    let phantom = blob_phantom(16);
    let stack = axial_stack(&phantom, 2.0);

    let mut params = ReconParams::default();
    params.outer_iterations = 1;
    params.sr_iterations = 5;
    let mut recon = Reconstruction::new(params);

    recon.create_template(&stack, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    recon
        .create_slices(&[stack], &[RigidTransform::identity()], &[2.0], None, None)
        .unwrap();
    recon.mask_slices();
    recon.run().unwrap();

    // Compare against the phantom on the reconstruction grid.
    let volume = recon.reconstructed();
    let mut reference = vec![0.0; volume.len()];
    let (nx, ny, nz) = volume.dims();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let w = volume.image_to_world([i as f64, j as f64, k as f64]);
                let c = phantom.world_to_image(w);
                reference[volume.idx(i, j, k)] =
                    svr_core::utils::sample_linear_padded(&phantom, c, -1.0).max(0.0);
            }
        }
    }
    let mask = signal_mask(&reference, 50.0);

    let ncc = correlation(&volume.data, &reference, &mask);
    assert!(ncc > 0.95, "reconstruction NCC {} should exceed 0.95", ncc);
    let err = nrmse(&volume.data, &reference, &mask);
    assert!(err < 0.1, "reconstruction NRMSE {} should be below 0.1", err);

    let report = recon.recon_quality_report();
    assert!(report.ncc > 0.95, "slice-space NCC {} should exceed 0.95", report.ncc);
    // The first E-step may bootstrap-exclude a worst slice; consistent
    // data must not lose more than that.
    assert!(
        report.ratio_excluded <= 0.25,
        "excluded ratio {} too high for consistent data",
        report.ratio_excluded
    );
}

#[test]
fn two_orthogonal_stacks_recover_the_phantom() {
    let phantom = blob_phantom(16);
    let stack_a = axial_stack(&phantom, 2.0);
    let stack_b = sagittal_stack(&phantom, 2.0);

    let mut params = ReconParams::default();
    params.outer_iterations = 3;
    params.sr_iterations = 5;
    let mut recon = Reconstruction::new(params);

    recon.create_template(&stack_a, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    let transforms = vec![RigidTransform::identity(); 2];
    recon
        .create_slices(&[stack_a, stack_b], &transforms, &[2.0, 2.0], None, None)
        .unwrap();
    recon.mask_slices();
    recon.run().unwrap();

    // Central axial plane against the ground-truth phantom.
    let volume = recon.reconstructed();
    let (nx, ny, nz) = volume.dims();
    let k = nz / 2;
    let mut recon_plane = Vec::with_capacity(nx * ny);
    let mut truth_plane = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            let w = volume.image_to_world([i as f64, j as f64, k as f64]);
            let c = phantom.world_to_image(w);
            recon_plane.push(volume.at(i, j, k).max(0.0));
            truth_plane.push(svr_core::utils::sample_linear_padded(&phantom, c, -1.0).max(0.0));
        }
    }
    let mask = signal_mask(&truth_plane, 50.0);
    let ncc = correlation(&recon_plane, &truth_plane, &mask);
    assert!(ncc >= 0.9, "central axial slice NCC {} should reach 0.9", ncc);
}

#[test]
fn corrupted_slice_is_excluded_after_one_em_cycle() {
    let phantom = blob_phantom(16);
    let stack = axial_stack(&phantom, 2.0);
    let n_slices = stack.dims().2;

    let mut recon = Reconstruction::new(ReconParams::default());
    recon.create_template(&stack, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    recon
        .create_slices(&[stack], &[RigidTransform::identity()], &[2.0], None, None)
        .unwrap();
    recon.mask_slices();

    // Corrupt one central slice with strong deterministic noise.
    let corrupted = n_slices / 2;
    {
        let mut rng = Lcg::new(12345);
        let mut noisy = Vec::new();
        {
            let rec_image = recon.slice_image(corrupted);
            for &v in &rec_image.data {
                noisy.push(if v > -0.01 { (v + 600.0 * rng.next_signed()).max(0.0) } else { v });
            }
        }
        recon.set_slice_intensities(corrupted, &noisy);
    }

    // One full EM cycle.
    recon.coeff_init();
    recon.gaussian_reconstruction();
    recon.initialize_em();
    recon.initialize_em_values();
    recon.simulate_slices();
    recon.initialize_robust_statistics();
    recon.e_step();

    assert!(
        recon.slice_weight(corrupted) <= 0.5,
        "corrupted slice weight {} should drop to 0.5 or below",
        recon.slice_weight(corrupted)
    );
    let report = recon.recon_quality_report();
    assert!(
        report.ratio_excluded >= 1.0 / n_slices as f64,
        "excluded ratio {} should cover the corrupted slice",
        report.ratio_excluded
    );

    // Healthy slices stay inliers.
    let healthy = corrupted + 2;
    assert!(recon.slice_weight(healthy) > 0.5);
}

#[test]
fn force_excluded_slices_stay_out() {
    let phantom = blob_phantom(16);
    let stack = axial_stack(&phantom, 2.0);

    let mut params = ReconParams::default();
    params.outer_iterations = 1;
    params.sr_iterations = 3;
    params.force_excluded = vec![5, 7];
    let mut recon = Reconstruction::new(params);

    recon.create_template(&stack, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    recon
        .create_slices(&[stack], &[RigidTransform::identity()], &[2.0], None, None)
        .unwrap();
    recon.mask_slices();
    recon.run().unwrap();

    assert_eq!(recon.slice_weight(5), 0.0);
    assert_eq!(recon.slice_weight(7), 0.0);

    // No PSF mass from the excluded slices entered the volume weights.
    let mut expected = vec![0.0; recon.reconstructed().len()];
    let (nx, ny, _) = recon.reconstructed().dims();
    for i in 0..recon.n_slices() {
        if i == 5 || i == 7 {
            continue;
        }
        recon.for_each_coefficient(i, |x, y, z, value| {
            expected[x + y * nx + z * nx * ny] += value;
        });
    }
    for (idx, &e) in expected.iter().enumerate() {
        let got = recon.volume_weight_at(idx);
        assert!(
            (got - e).abs() < 1e-9,
            "volume weight at {} includes excluded mass: {} vs {}",
            idx,
            got,
            e
        );
    }
}

#[test]
fn all_zero_mask_halts_at_set_mask() {
    let phantom = blob_phantom(12);
    let stack = axial_stack(&phantom, 2.0);
    let mut zero_mask = stack.clone();
    zero_mask.data.iter_mut().for_each(|v| *v = 0.0);

    let mut recon = Reconstruction::new(ReconParams::default());
    recon.create_template(&stack, 1.0).unwrap();
    let err = recon.set_mask(Some(&zero_mask), 0.0, 0.5).unwrap_err();
    assert!(matches!(err, ReconError::EmptyRoi(_)));
}

#[test]
fn slice_info_csv_lists_every_slice() {
    let phantom = blob_phantom(12);
    let stack = axial_stack(&phantom, 2.0);

    let mut recon = Reconstruction::new(ReconParams::default());
    recon.create_template(&stack, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    recon
        .create_slices(&[stack], &[RigidTransform::identity()], &[2.0], None, None)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary-slice-info.csv");
    recon.save_slice_info(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), recon.n_slices() + 1);
    assert!(lines[0].starts_with("Stack,Slice,"));
    assert!(lines[1].starts_with("0,0,"));
}
