//! Remote-registration exchange protocol

mod common;

use common::{axial_stack, blob_phantom};
use svr_core::{ReconError, ReconParams, Reconstruction, RigidTransform};

fn engine_with_stack(params: ReconParams) -> Reconstruction {
    let phantom = blob_phantom(12);
    let stack = axial_stack(&phantom, 2.0);
    let mut recon = Reconstruction::new(params);
    recon.create_template(&stack, 1.0).unwrap();
    recon.set_mask(None, 0.0, 0.5).unwrap();
    recon
        .create_slices(&[stack], &[RigidTransform::identity()], &[2.0], None, None)
        .unwrap();
    recon.mask_slices();
    recon
}

#[test]
fn identity_worker_round_trip_keeps_poses() {
    let mut recon = engine_with_stack(ReconParams::default());
    let dir = tempfile::tempdir().unwrap();
    let n = recon.n_slices();

    let mut waves = Vec::new();
    recon
        .remote_slice_to_volume_registration(0, dir.path(), |start, stop| {
            // A worker that accepts the initial transforms as final.
            waves.push((start, stop));
            Ok(())
        })
        .unwrap();

    assert_eq!(waves, vec![(0, n)], "one wave for {} slices", n);
    assert!(dir.path().join("current-source.nii.gz").exists());
    assert!(dir.path().join("current-mask.nii.gz").exists());
    assert!(dir.path().join("res-slice-0.nii.gz").exists());
    assert!(dir.path().join("res-transformation-0.dof").exists());

    // The offset composition and its inverse must cancel.
    for i in 0..n {
        for v in recon.slice_pose(i).rigid().params() {
            assert!(v.abs() < 1e-6, "identity worker moved a pose: {}", v);
        }
    }
}

#[test]
fn worker_translation_is_read_back() {
    let mut recon = engine_with_stack(ReconParams::default());
    let dir = tempfile::tempdir().unwrap();
    let exchange = dir.path().to_path_buf();

    recon
        .remote_slice_to_volume_registration(0, &exchange, |start, stop| {
            // A worker that shifts every transform by 3 mm in x.
            for i in start..stop {
                let path = exchange.join(format!("res-transformation-{}.dof", i));
                let t = RigidTransform::read_dof(&path)?;
                let mut p = t.params();
                p[0] += 3.0;
                RigidTransform::from_params(p).write_dof(&path)?;
            }
            Ok(())
        })
        .unwrap();

    for i in 0..recon.n_slices() {
        let p = recon.slice_pose(i).rigid().params();
        assert!(
            (p[0] - 3.0).abs() < 1e-6,
            "worker translation lost on slice {}: {:?}",
            i,
            p
        );
    }
}

#[test]
fn missing_result_file_is_fatal() {
    let mut recon = engine_with_stack(ReconParams::default());
    let dir = tempfile::tempdir().unwrap();
    let exchange = dir.path().to_path_buf();

    let err = recon
        .remote_slice_to_volume_registration(0, &exchange, |_start, _stop| {
            // A worker that consumes its input without producing output.
            std::fs::remove_file(exchange.join("res-transformation-0.dof"))
                .map_err(|e| svr_core::ReconError::Io(e.to_string()))?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ReconError::MissingExchangeFile(_)));
}

#[test]
fn ffd_mode_uses_unreset_slice_files() {
    let mut params = ReconParams::default();
    params.ffd = true;
    let mut recon = engine_with_stack(params);
    let dir = tempfile::tempdir().unwrap();

    recon
        .remote_slice_to_volume_registration(0, dir.path(), |_start, _stop| Ok(()))
        .unwrap();

    assert!(dir.path().join("slice-0.nii.gz").exists());
    assert!(dir.path().join("transformation-0.dof").exists());
    assert!(!dir.path().join("res-slice-0.nii.gz").exists());
    // Round trip kept the free-form kind.
    assert!(matches!(
        recon.slice_pose(0),
        svr_core::SlicePose::FreeForm(_)
    ));
}

#[test]
fn registration_recovers_a_shifted_slice_locally() {
    // Local-mode counterpart of the exchange: perturb one pose and let
    // the built-in registrator walk it back.
    let mut recon = engine_with_stack(ReconParams::default());
    recon.coeff_init();
    recon.gaussian_reconstruction();

    let victim = recon.n_slices() / 2;
    recon.set_slice_pose(
        victim,
        svr_core::SlicePose::Rigid(RigidTransform::from_params([
            1.5, -1.0, 0.0, 0.0, 0.0, 0.0,
        ])),
    );
    recon.register_slices_to_volume();
    let p = recon.slice_pose(victim).rigid().params();
    assert!(
        p[0].abs() < 0.6 && p[1].abs() < 0.6,
        "registration should undo the shift, got {:?}",
        p
    );
}
