use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::fit::{FitOrchestrator, FitResult};
use crate::fits::read_primary;
use crate::model::ModelEvaluator;
use crate::params::ParameterRecord;
use crate::patch::{flux_scale, load_patches};
use crate::psf::{PsfConfig, PsfLibrary};
use crate::report::{write_inputs, write_results};
use crate::settings::Settings;
use crate::solver::LevenbergMarquardt;

/// Read every distinct PSF file once, in sorted path order
fn read_psfs(settings: &Settings) -> Result<Vec<(PathBuf, ndarray::Array2<f64>)>> {
    let unique: BTreeSet<&Path> = settings.images.iter().map(|img| img.psf.as_path()).collect();
    unique
        .into_iter()
        .map(|path| {
            let raster = read_primary(path).with_context(|| format!("Failed to read PSF {}", path.display()))?;
            Ok((path.to_path_buf(), raster))
        })
        .collect()
}

/// Full pipeline: settings file to persisted fit products
pub fn run_fit(param_file: &Path) -> Result<FitResult> {
    let settings = Settings::from_file(param_file)
        .with_context(|| format!("Failed to load settings from {}", param_file.display()))?;

    std::fs::create_dir_all(&settings.base_dir)
        .with_context(|| format!("Failed to create output directory {}", settings.base_dir.display()))?;

    let image_psfs: Vec<PathBuf> = settings.images.iter().map(|img| img.psf.clone()).collect();
    let psfs = PsfLibrary::build(read_psfs(&settings)?, &image_psfs, PsfConfig::from(&settings))
        .context("Failed to prepare PSFs")?;

    let patches = load_patches(&settings, psfs.padsize).context("Failed to ingest image patches")?;
    write_inputs(&settings.base_dir, &patches, &psfs).context("Failed to write input dump")?;

    let flux_scale = flux_scale(&patches);
    info!("flux_scale {}", flux_scale);

    let evaluator = ModelEvaluator::new(&settings, &patches, &psfs)?;
    let solver = LevenbergMarquardt::default();
    let orchestrator = FitOrchestrator::new(&evaluator, &solver, flux_scale);
    let result = orchestrator
        .run(ParameterRecord::initial(&settings, flux_scale))
        .context("Fit failed")?;

    write_results(&settings.base_dir, &settings, &patches, &result).context("Failed to write fit results")?;
    info!(
        "Done: chi^2 {:.2} after {} iterations ({:?})",
        result.chi2, result.iterations, result.stop
    );
    Ok(result)
}
