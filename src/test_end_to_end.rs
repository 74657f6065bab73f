//! Synthetic end-to-end fits: in-memory exposures through ingestion, the staged
//! fit and the report writer.

use approx::assert_abs_diff_eq;
use flate2::read::GzDecoder;
use ndarray::Array2;
use rand::prelude::*;
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;

use crate::fit::{FitOrchestrator, StopReason};
use crate::image_source::InMemoryImage;
use crate::model::{sky_estimate, ModelEvaluator, RenderMode};
use crate::params::{ParameterLayout, ParameterRecord};
use crate::patch::{flux_scale, ingest, PatchData};
use crate::psf::{PsfConfig, PsfLibrary};
use crate::report::{results_text, write_inputs, write_results, ARCHIVE_FILE, RESULTS_FILE};
use crate::settings::{synthetic_settings, ExtensionId, Settings};
use crate::solver::LevenbergMarquardt;
use crate::wcs::TanWcs;

const ARCSEC: f64 = 1.0 / 3600.0;
const SIDE: usize = 31;
/// 0-based pixel under the reference position (CRPIX 16)
const CENTRE: usize = 15;

fn ext(name: &str) -> ExtensionId {
    ExtensionId::Name(name.to_string())
}

/// 31x31 exposure at 1"/pixel with unit errors and a clean DQ plane
fn exposure(sci: Array2<f64>, mjd: f64) -> InMemoryImage {
    let wcs = TanWcs::new([16.0, 16.0], [150.0, 2.0], [[-ARCSEC, 0.0], [0.0, ARCSEC]]).unwrap();
    InMemoryImage::new("synthetic", wcs)
        .with_array(&ext("SCI"), sci)
        .with_array(&ext("ERR"), Array2::ones((SIDE, SIDE)))
        .with_array(&ext("DQ"), Array2::zeros((SIDE, SIDE)))
        .with_header("EXPSTART", mjd)
        .with_header("EXPEND", mjd + 0.5)
}

/// Flat 100 background with a point source of `flux` on the reference pixel
fn transient_scene(flux: f64) -> Array2<f64> {
    let mut sci = Array2::from_elem((SIDE, SIDE), 100.0);
    sci[[CENTRE, CENTRE]] += flux;
    sci
}

/// Delta-function PSF shared by every image
fn delta_psfs(settings: &Settings) -> PsfLibrary {
    let path = PathBuf::from("psf.fits");
    let mut delta = Array2::zeros((3, 3));
    delta[[1, 1]] = 1.0;
    PsfLibrary::build(
        vec![(path.clone(), delta)],
        &vec![path; settings.n_img()],
        PsfConfig::from(settings),
    )
    .unwrap()
}

fn ingest_all(settings: &Settings, psfs: &PsfLibrary, scenes: &[Array2<f64>]) -> Vec<PatchData> {
    settings
        .images
        .iter()
        .zip(scenes)
        .enumerate()
        .map(|(i, (image, sci))| {
            ingest(&exposure(sci.clone(), 60000.0 + i as f64), image, None, &[], settings, psfs.padsize).unwrap()
        })
        .collect()
}

/// Flat galaxy guess with no transient flux
fn zero_flux_start(settings: &Settings, flux_scale: f64) -> ParameterRecord {
    let mut record = ParameterRecord::initial(settings, flux_scale);
    record.flux.iter_mut().for_each(|f| *f = 0.0);
    record
}

#[test]
fn test_recovers_transient_flux() {
    let settings = synthetic_settings(json!({}));
    let psfs = delta_psfs(&settings);
    let patches = ingest_all(&settings, &psfs, &[transient_scene(50.0)]);
    let scale = flux_scale(&patches);
    assert_abs_diff_eq!(scale, 100.0, epsilon = 1e-9);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let solver = LevenbergMarquardt::default();
    let orchestrator = FitOrchestrator::new(&evaluator, &solver, scale);
    let result = orchestrator.run(zero_flux_start(&settings, scale)).unwrap();

    assert!((result.record.flux[0] - 50.0).abs() < 0.5, "flux {}", result.record.flux[0]);
    assert!(result.chi2 < 1e-4, "chi2 {}", result.chi2);
    assert!(result.iterations <= settings.n_iter);
    assert_eq!(result.stop, StopReason::FluxConverged);

    assert!(!result.covariance_degenerate);
    assert_eq!(result.flux_covariance.shape(), (1, 1));
    assert!(result.flux_covariance[(0, 0)] > 0.0);
    // coefficients, one dRA, one dDec, one flux
    assert_eq!(result.n_fit_params(), settings.n_coeff + 3);

    let pt = &result.products.pt_models[0];
    assert_abs_diff_eq!(pt[[5, 5]], result.record.flux[0], epsilon = 1e-3);
    for (r, w) in result.products.residuals[0].iter().zip(patches[0].invvar.iter()) {
        if *w == 0.0 {
            assert_eq!(*r, 0.0);
        }
    }
}

#[test]
fn test_recovers_transient_flux_oversampled() {
    for oversample in [2, 3] {
        let settings = synthetic_settings(json!({ "oversample": oversample }));
        assert_eq!(settings.oversample2(), oversample / 2);
        let psfs = delta_psfs(&settings);
        assert!(psfs.padsize >= settings.patch * oversample);
        let patches = ingest_all(&settings, &psfs, &[transient_scene(50.0)]);
        assert_eq!(patches[0].ras.dim(), (psfs.padsize, psfs.padsize));
        let scale = flux_scale(&patches);

        let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
        let solver = LevenbergMarquardt::default();
        let result = FitOrchestrator::new(&evaluator, &solver, scale)
            .run(zero_flux_start(&settings, scale))
            .unwrap();

        let flux = result.record.flux[0];
        assert!((flux - 50.0).abs() < 0.5, "oversample {}: flux {}", oversample, flux);
        assert!(result.chi2 < 1e-4, "oversample {}: chi2 {}", oversample, result.chi2);
        assert_eq!(result.products.models[0].dim(), (settings.patch, settings.patch));
        assert_abs_diff_eq!(result.products.pt_models[0][[5, 5]], flux, epsilon = 1e-3);
    }
}

#[test]
fn test_iteration_cap() {
    let settings = synthetic_settings(json!({ "n_iter": 1 }));
    let psfs = delta_psfs(&settings);
    let mut scene = transient_scene(30.0);
    scene[[CENTRE + 2, CENTRE - 1]] += 12.0;
    let patches = ingest_all(&settings, &psfs, &[scene]);
    let scale = flux_scale(&patches);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let solver = LevenbergMarquardt::default();
    let result = FitOrchestrator::new(&evaluator, &solver, scale)
        .run(zero_flux_start(&settings, scale))
        .unwrap();
    assert_eq!(result.iterations, 1);
    assert_eq!(result.stop, StopReason::IterationCap);
    assert_abs_diff_eq!(
        result.chi2,
        crate::pulls::chi2(&evaluator, &result.record),
        epsilon = 1e-9 * result.chi2.max(1.0)
    );
}

#[test]
fn test_chi2_by_hand() {
    // Flat 100, transient 30 on the centre, one extra 12 on a weighted pixel.
    // With no galaxy and the transient at its true flux, the sky takes the
    // weighted mean 100 + 12/N and chi2 = 144 (N - 1) / N.
    let settings = synthetic_settings(json!({}));
    let psfs = delta_psfs(&settings);
    let mut scene = transient_scene(30.0);
    scene[[CENTRE + 2, CENTRE - 1]] += 12.0;
    let patches = ingest_all(&settings, &psfs, &[scene]);
    let invvar = &patches[0].invvar;
    assert_eq!(invvar[[7, 4]], 1.0);
    assert!(invvar.iter().all(|&w| w == 0.0 || w == 1.0));
    let n = invvar.iter().filter(|&&w| w > 0.0).count() as f64;

    let mut record = ParameterRecord::initial(&settings, 0.0);
    record.flux[0] = 30.0;
    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let chi2 = crate::pulls::chi2(&evaluator, &record);
    assert_abs_diff_eq!(chi2, 144.0 * (n - 1.0) / n, epsilon = 1e-6);

    // Offsets add the centroid prior: 0.5" / 1" in RA (scaled by cos Dec) and Dec
    record.sn_d_ra = 0.0;
    record.d_dec[0] = 0.5 * ARCSEC;
    let prior = crate::pulls::centroid_prior(&evaluator, &record);
    assert_eq!(prior.len(), 2);
    assert_abs_diff_eq!(prior[0], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(prior[1], 0.5, epsilon = 1e-9);
}

#[test]
fn test_iterative_centroid_mode() {
    let settings = synthetic_settings(json!({
        "images": ["a.fits", "b.fits"],
        "epochs": [1, 1],
        "iterative_centroid": 1,
    }));
    let psfs = delta_psfs(&settings);
    let patches = ingest_all(&settings, &psfs, &[transient_scene(40.0), transient_scene(40.0)]);
    let scale = flux_scale(&patches);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let solver = LevenbergMarquardt::default();
    let result = FitOrchestrator::new(&evaluator, &solver, scale)
        .run(zero_flux_start(&settings, scale))
        .unwrap();

    assert!((result.record.flux[0] - 40.0).abs() < 0.4, "flux {}", result.record.flux[0]);
    // Only the galaxy+transient stage moves the flux in this mode
    assert!(!result.covariance_degenerate);
    assert_eq!(result.n_fit_params(), settings.n_coeff + 1);
}

#[test]
fn test_galaxy_only_fit() {
    let settings = synthetic_settings(json!({ "epochs": [0] }));
    assert_eq!(settings.n_epoch, 0);
    let psfs = delta_psfs(&settings);
    let scene = Array2::from_shape_fn((SIDE, SIDE), |(i, j)| {
        let r2 = (i as f64 - CENTRE as f64).powi(2) + (j as f64 - CENTRE as f64).powi(2);
        100.0 + 20.0 * (-r2 / 8.0).exp()
    });
    let patches = ingest_all(&settings, &psfs, &[scene]);
    let scale = flux_scale(&patches);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let start = ParameterRecord::initial(&settings, scale);
    let start_chi2 = crate::pulls::chi2(&evaluator, &start);

    let solver = LevenbergMarquardt::default();
    let result = FitOrchestrator::new(&evaluator, &solver, scale).run(start).unwrap();
    assert!(result.record.flux.is_empty());
    assert!(result.chi2 < start_chi2);
    assert!(matches!(result.stop, StopReason::Chi2Converged | StopReason::IterationCap));
    assert_eq!(result.flux_covariance.shape(), (0, 0));

    // No transient: point-source models are all zero
    assert!(result.products.pt_models[0].iter().all(|&v| v == 0.0));
}

#[test]
fn test_report_files() {
    let dir = TempDir::new().unwrap();
    let settings = synthetic_settings(json!({ "n_iter": 2 }));
    let psfs = delta_psfs(&settings);
    let patches = ingest_all(&settings, &psfs, &[transient_scene(50.0)]);
    let scale = flux_scale(&patches);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();
    let solver = LevenbergMarquardt::default();
    let result = FitOrchestrator::new(&evaluator, &solver, scale)
        .run(zero_flux_start(&settings, scale))
        .unwrap();

    write_inputs(dir.path(), &patches, &psfs).unwrap();
    write_results(dir.path(), &settings, &patches, &result).unwrap();
    for name in [
        "models.fits",
        "residuals.fits",
        "pulls.fits",
        "pt_models.fits",
        "scidata.fits",
        "invvars.fits",
        "pixel_area_map.fits",
        "pixel_sampled_RAs.fits",
        "pixel_sampled_Decs.fits",
        "psf_subpixelized.fits",
        ARCHIVE_FILE,
    ] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }

    let text = std::fs::read_to_string(dir.path().join(RESULTS_FILE)).unwrap();
    assert_eq!(text, results_text(&settings, &patches, &result).unwrap());
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("version "));
    assert!(lines[1].starts_with("chi2 "));

    let n_pixels = patches[0].invvar.iter().filter(|&&w| w > 0.0).count();
    assert_eq!(lines[2], format!("Npixels  {} ", n_pixels));
    assert_eq!(lines[3], format!("DoF {} ", n_pixels - result.n_fit_params()));
    assert_eq!(lines[4], "Npixels_with_pull_gt_5 0 ");
    assert!(text.contains("\nSNCmat:\nSN_A1 "));
    assert!(text.contains("\nMean MJD:\nMJD_1 60000.25 "));
    assert!(text.contains("\nCmat:\n0,0: "));
    assert!(text.contains("\nWmat:\n0,0: "));

    let json_line = text.split("PARSED_JSON_BELOW\n").nth(1).unwrap().trim();
    let parsed: Value = serde_json::from_str(json_line).unwrap();
    assert_abs_diff_eq!(parsed["SN_ampl"][0].as_f64().unwrap(), result.record.flux[0], epsilon = 1e-9);
    assert_eq!(parsed["coeffs"].as_array().unwrap().len(), 5);
    assert!(parsed["pt_RA"][0].as_f64().is_some());

    let archive = std::fs::File::open(dir.path().join(ARCHIVE_FILE)).unwrap();
    let state: Value = serde_json::from_reader(GzDecoder::new(archive)).unwrap();
    assert_eq!(state["patches"].as_array().unwrap().len(), 1);
    assert_eq!(state["covariance_degenerate"], json!(false));
    assert_eq!(state["flux_covariance"].as_array().unwrap().len(), 1);
}

#[test]
fn test_inverse_variance_is_never_negative() {
    let mut rng = StdRng::seed_from_u64(3);
    let settings = synthetic_settings(json!({ "okaydqs": [4] }));
    let psfs = delta_psfs(&settings);

    for _ in 0..5 {
        let sci = Array2::from_shape_fn((SIDE, SIDE), |_| {
            if rng.gen_bool(0.05) {
                f64::NAN
            } else {
                rng.gen_range(-50.0..500.0)
            }
        });
        let err = Array2::from_shape_fn((SIDE, SIDE), |_| match rng.gen_range(0..20) {
            0 => 0.0,
            1 => f64::INFINITY,
            2 => -1.0,
            _ => rng.gen_range(0.1..10.0),
        });
        let dq = Array2::from_shape_fn((SIDE, SIDE), |_| [0.0, 4.0, 8.0, 12.0][rng.gen_range(0..4)]);
        let wcs = TanWcs::new([16.0, 16.0], [150.0, 2.0], [[-ARCSEC, 0.0], [0.0, ARCSEC]]).unwrap();
        let image = InMemoryImage::new("noisy", wcs)
            .with_array(&ext("SCI"), sci)
            .with_array(&ext("ERR"), err)
            .with_array(&ext("DQ"), dq);

        let patch = ingest(&image, &settings.images[0], None, &[], &settings, psfs.padsize).unwrap();
        for (&w, &d) in patch.invvar.iter().zip(patch.sci.iter()) {
            assert!(w >= 0.0 && w.is_finite());
            assert!(d.is_finite());
        }
    }
}

#[test]
fn test_sky_is_zero_when_model_matches() {
    let mut rng = StdRng::seed_from_u64(5);
    let settings = synthetic_settings(json!({}));
    let psfs = delta_psfs(&settings);
    let patches = ingest_all(&settings, &psfs, &[transient_scene(25.0)]);
    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs).unwrap();

    let layout = ParameterLayout::from_settings(&settings);
    let params: Vec<f64> = (0..layout.len()).map(|_| rng.gen_range(0.0..5.0)).collect();
    let mut record = layout.parse(&params).unwrap();
    record.d_ra[0] = rng.gen_range(-1.0..1.0) * ARCSEC;
    record.d_dec[0] = rng.gen_range(-1.0..1.0) * ARCSEC;
    record.sn_d_ra = 0.0;
    record.sn_d_dec = 0.0;
    let models = evaluator.render_all(&record, RenderMode::Full);

    // A model that already includes its sky leaves nothing for the sky term
    let sky = sky_estimate(&models[0], &models[0], &patches[0].invvar);
    assert_eq!(sky, 0.0);
    let again = sky_estimate(&patches[0].sci, &models[0], &patches[0].invvar);
    assert_abs_diff_eq!(again, 0.0, epsilon = 1e-9);
}
