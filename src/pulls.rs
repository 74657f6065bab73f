/// Weighted residual vector minimised by the solver
///
/// Layout: `(data - model) * sqrt(invvar)` for each requested image in order,
/// flattened row-major, followed by the centroid prior for every image
/// (all RA terms, then all Dec terms, in arcsec / prior width).
use ndarray::{Array2, Zip};

use crate::error::Result;
use crate::model::{ModelEvaluator, RenderMode};
use crate::params::{ParameterLayout, ParameterRecord};

/// `(data - model) * sqrt(invvar)`
pub fn pull_image(data: &Array2<f64>, model: &Array2<f64>, invvar: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(data.dim());
    Zip::from(&mut out)
        .and(data)
        .and(model)
        .and(invvar)
        .for_each(|p, &d, &m, &w| *p = (d - m) * w.sqrt());
    out
}

/// Pseudo-residuals tying each image's transient position to its reference
pub fn centroid_prior(evaluator: &ModelEvaluator, record: &ParameterRecord) -> Vec<f64> {
    let prior = evaluator.settings().centroid_prior_arcsec;
    let patches = evaluator.patches();
    let ra_terms = patches.iter().enumerate().map(|(i, p)| {
        (record.point_ra(p.ra0, i) - p.ra0) * p.dec0.to_radians().cos() * 3600.0 / prior
    });
    let dec_terms = patches
        .iter()
        .enumerate()
        .map(|(i, p)| (record.point_dec(p.dec0, i) - p.dec0) * 3600.0 / prior);
    ra_terms.chain(dec_terms).collect()
}

/// Full residual vector over `images`
pub fn pulls(evaluator: &ModelEvaluator, record: &ParameterRecord, images: &[usize]) -> Vec<f64> {
    let models = evaluator.render(record, images, RenderMode::Full);
    let patches = evaluator.patches();
    let mut out = Vec::with_capacity(images.len() * evaluator.settings().patch.pow(2) + 2 * patches.len());
    for (&i, model) in images.iter().zip(&models) {
        let p = &patches[i];
        out.extend(pull_image(&p.sci, model, &p.invvar).iter().copied());
    }
    out.extend(centroid_prior(evaluator, record));
    out
}

/// Residual function in the solver's calling convention: flat parameters plus image list
pub fn pulls_for_vector(
    evaluator: &ModelEvaluator,
    layout: &ParameterLayout,
    params: &[f64],
    images: &[usize],
) -> Result<Vec<f64>> {
    let record = layout.parse(params)?;
    Ok(pulls(evaluator, &record, images))
}

/// Sum of squared pulls over every image
pub fn chi2(evaluator: &ModelEvaluator, record: &ParameterRecord) -> f64 {
    let all: Vec<usize> = (0..evaluator.patches().len()).collect();
    pulls(evaluator, record, &all).iter().map(|p| p * p).sum()
}
