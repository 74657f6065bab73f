/// Persisted fit products: FITS cubes, the text report and the compressed state archive
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::DMatrix;
use ndarray::Array2;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{FitError, Result};
use crate::fit::{FitResult, StopReason};
use crate::fits::{write_image, write_planes};
use crate::params::{ParameterRecord, ParsedParameters};
use crate::patch::PatchData;
use crate::psf::PsfLibrary;
use crate::settings::Settings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const RESULTS_FILE: &str = "results.txt";
pub const ARCHIVE_FILE: &str = "fit_results.json.gz";
pub const PULL_THRESHOLDS: [f64; 4] = [5.0, 10.0, 20.0, 50.0];

fn matrix_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

/// Everything needed to rebuild the fit offline
#[derive(Serialize)]
struct FitArchive<'a> {
    version: &'a str,
    settings: &'a Settings,
    patches: &'a [PatchData],
    record: &'a ParameterRecord,
    parsed: ParsedParameters,
    chi2: f64,
    iterations: usize,
    stop: StopReason,
    flux_covariance: Vec<Vec<f64>>,
    covariance_degenerate: bool,
    covariance: Option<Vec<Vec<f64>>>,
    covariance_active: &'a [usize],
}

fn stack(patches: &[PatchData], plane: impl Fn(&PatchData) -> &Array2<f64>) -> Vec<Array2<f64>> {
    patches.iter().map(|p| plane(p).clone()).collect()
}

/// Write the ingested inputs: one plane per image, plus the subpixel PSFs
pub fn write_inputs(dir: &Path, patches: &[PatchData], psfs: &PsfLibrary) -> Result<()> {
    write_planes(&dir.join("scidata.fits"), &stack(patches, |p| &p.sci))?;
    write_planes(&dir.join("invvars.fits"), &stack(patches, |p| &p.invvar))?;
    write_planes(&dir.join("pixel_area_map.fits"), &stack(patches, |p| &p.pixel_area))?;
    write_planes(&dir.join("pixel_sampled_RAs.fits"), &stack(patches, |p| &p.pixel_ras))?;
    write_planes(&dir.join("pixel_sampled_Decs.fits"), &stack(patches, |p| &p.pixel_decs))?;

    let rasters: Vec<Array2<f64>> = psfs.entries().iter().map(|e| e.subpixel.clone()).collect();
    let same_size = rasters.windows(2).all(|w| w[0].dim() == w[1].dim());
    if same_size {
        write_planes(&dir.join("psf_subpixelized.fits"), &rasters)?;
    } else {
        for (k, raster) in rasters.iter().enumerate() {
            write_image(&dir.join(format!("psf_subpixelized_{}.fits", k)), raster)?;
        }
    }
    info!("Wrote input dump to {}", dir.display());
    Ok(())
}

/// Number of weighted pixels, counted over every image
pub fn weighted_pixel_count(patches: &[PatchData]) -> usize {
    patches
        .iter()
        .map(|p| p.invvar.iter().filter(|&&w| w > 0.0).count())
        .sum()
}

fn mean_mjd(settings: &Settings, patches: &[PatchData], epoch: usize) -> f64 {
    let images = settings.images_in_epoch(epoch);
    if images.is_empty() {
        return f64::NAN;
    }
    images.iter().map(|&i| patches[i].mjd).sum::<f64>() / images.len() as f64
}

fn write_matrix(out: &mut String, m: &DMatrix<f64>) -> fmt::Result {
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            writeln!(out, "{},{}: {} ", i, j, m[(i, j)])?;
        }
        out.push('\n');
    }
    Ok(())
}

fn write_summary(out: &mut String, settings: &Settings, patches: &[PatchData], result: &FitResult) -> fmt::Result {
    let n_pixels = weighted_pixel_count(patches);
    let dof = n_pixels as i64 - result.n_fit_params() as i64;

    writeln!(out, "version {} ", VERSION)?;
    writeln!(out, "chi2 {} ", result.chi2)?;
    writeln!(out, "Npixels  {} ", n_pixels)?;
    writeln!(out, "DoF {} ", dof)?;
    for threshold in PULL_THRESHOLDS {
        let count: usize = result
            .products
            .pulls
            .iter()
            .map(|p| p.iter().filter(|v| v.abs() > threshold).count())
            .sum();
        writeln!(out, "Npixels_with_pull_gt_{} {} ", threshold, count)?;
    }
    writeln!(out, "covariance_degenerate {} ", u8::from(result.covariance_degenerate))?;

    out.push_str("\nSNCmat:\n");
    for (k, flux) in result.record.flux.iter().enumerate() {
        let sigma = result.flux_covariance[(k, k)].sqrt();
        writeln!(out, "SN_A{} {} {} ", settings.epoch_names[k + 1], flux, sigma)?;
    }

    out.push_str("\nMean MJD:\n");
    for epoch in 1..=settings.n_epoch {
        writeln!(
            out,
            "MJD_{} {} ",
            settings.epoch_names[epoch],
            mean_mjd(settings, patches, epoch)
        )?;
    }

    out.push_str("\nCmat:\n");
    write_matrix(out, &result.flux_covariance)?;

    let n = result.flux_covariance.nrows();
    let weights = if n == 0 || result.covariance_degenerate {
        DMatrix::zeros(n, n)
    } else {
        result.flux_covariance.clone().try_inverse().unwrap_or_else(|| {
            warn!("Flux covariance is singular; writing zero weight matrix");
            DMatrix::zeros(n, n)
        })
    };
    out.push_str("\nWmat:\n");
    write_matrix(out, &weights)
}

/// Contents of `results.txt`
pub fn results_text(settings: &Settings, patches: &[PatchData], result: &FitResult) -> Result<String> {
    let mut out = String::new();
    write_summary(&mut out, settings, patches, result)?;
    out.push_str("PARSED_JSON_BELOW\n");
    out.push_str(&serde_json::to_string(&ParsedParameters::new(&result.record, settings))?);
    out.push('\n');
    Ok(out)
}

fn write_archive(path: &Path, archive: &FitArchive) -> Result<()> {
    let file = File::create(path).map_err(|e| FitError::io(path, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, archive)?;
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| FitError::io(path, e))
}

/// Write every fit product into `dir`
pub fn write_results(dir: &Path, settings: &Settings, patches: &[PatchData], result: &FitResult) -> Result<()> {
    let products = &result.products;
    write_planes(&dir.join("models.fits"), &products.models)?;
    write_planes(&dir.join("residuals.fits"), &products.residuals)?;
    write_planes(&dir.join("pulls.fits"), &products.pulls)?;
    write_planes(&dir.join("pt_models.fits"), &products.pt_models)?;

    let archive_path = dir.join(ARCHIVE_FILE);
    info!("Dumping fit state into {}", archive_path.display());
    write_archive(
        &archive_path,
        &FitArchive {
            version: VERSION,
            settings,
            patches,
            record: &result.record,
            parsed: ParsedParameters::new(&result.record, settings),
            chi2: result.chi2,
            iterations: result.iterations,
            stop: result.stop,
            flux_covariance: matrix_rows(&result.flux_covariance),
            covariance_degenerate: result.covariance_degenerate,
            covariance: result.covariance.as_ref().map(matrix_rows),
            covariance_active: &result.covariance_active,
        },
    )?;

    let text_path = dir.join(RESULTS_FILE);
    std::fs::write(&text_path, results_text(settings, patches, result)?).map_err(|e| FitError::io(&text_path, e))?;
    info!("Wrote {}", text_path.display());
    Ok(())
}
