/// Patch ingestion: cut a fixed-size window around the transient out of every
/// exposure, together with sky-coordinate grids, weights and masks.
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{FitError, Result};
use crate::fits::{read_extension, FitsImage};
use crate::image_source::{observation_mjd, ImageSource};
use crate::settings::{ExtensionId, ImageSettings, Settings};
use crate::sky_fit::SkyToPatch;

/// Everything the model needs to know about one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchData {
    pub label: String,
    pub sci: Array2<f64>,
    /// Inverse variance; zero where masked or invalid
    pub invvar: Array2<f64>,
    /// Sky coordinates of the oversampled grid (`padsize` x `padsize`)
    pub ras: Array2<f64>,
    pub decs: Array2<f64>,
    /// Sky coordinates of the detector-pixel centres (`patch` x `patch`)
    pub pixel_ras: Array2<f64>,
    pub pixel_decs: Array2<f64>,
    pub sky_to_patch: SkyToPatch,
    pub pixel_area: Array2<f64>,
    pub mjd: f64,
    /// 0-based `[row_start, row_end, col_start, col_end)` of the patch in the exposure
    pub pixel_range: [i64; 4],
    pub ra0: f64,
    pub dec0: f64,
    pub epoch: usize,
}

impl PatchData {
    pub fn has_valid_pixels(&self) -> bool {
        self.invvar.iter().any(|&w| w > 0.0)
    }
}

/// Cut `rows` x `cols` out of `data`, padding anything off the edge with `fill`
pub fn robust_index(data: &Array2<f64>, rows: (i64, i64), cols: (i64, i64), fill: f64) -> Array2<f64> {
    let (nr, nc) = data.dim();
    let height = (rows.1 - rows.0).max(0) as usize;
    let width = (cols.1 - cols.0).max(0) as usize;
    Array2::from_shape_fn((height, width), |(i, j)| {
        let r = rows.0 + i as i64;
        let c = cols.0 + j as i64;
        if r >= 0 && c >= 0 && (r as usize) < nr && (c as usize) < nc {
            data[[r as usize, c as usize]]
        } else {
            fill
        }
    })
}

/// Read a bad-pixel list: one 1-based `x y` pair per line, `#` comments allowed
pub fn read_bad_pixel_list(path: &Path) -> Result<Vec<(usize, usize)>> {
    let text = std::fs::read_to_string(path).map_err(|e| FitError::io(path, e))?;
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let parsed: Option<Vec<usize>> = content
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f64>().ok().filter(|v| *v >= 1.0).map(|v| v.round() as usize))
            .collect();
        match parsed.as_deref() {
            Some([x, y]) => out.push((*x, *y)),
            _ => {
                return Err(FitError::SettingsSyntax {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    message: format!("expected a 1-based `x y` pair, got `{}`", content),
                })
            }
        }
    }
    Ok(out)
}

/// Build the patch of one exposure
pub fn ingest(
    source: &dyn ImageSource,
    image: &ImageSettings,
    pixel_area_map: Option<&Array2<f64>>,
    bad_pixels: &[(usize, usize)],
    settings: &Settings,
    padsize: usize,
) -> Result<PatchData> {
    let label = source.label();
    let patch = settings.patch;
    let p2 = settings.patch2() as i64;
    let o = settings.oversample as f64;

    let mjd = observation_mjd(source);
    let transform = source.sky_transform(&image.sci_ext)?;
    let (x, y) = transform.world_to_pixel(image.ra0, image.dec0);
    if !x.is_finite() || !y.is_finite() {
        return Err(FitError::Ingest {
            image: label,
            message: format!("reference position ({}, {}) does not project onto the image", image.ra0, image.dec0),
        });
    }
    let (px, py) = (x.round() as i64, y.round() as i64);

    // Dense oversampled sky grid; median(arange(patch * o) / o) centres it on the patch
    let over_median = (patch as f64 * o - 1.0) / (2.0 * o);
    let mut ras = Array2::zeros((padsize, padsize));
    let mut decs = Array2::zeros((padsize, padsize));
    for a in 0..padsize {
        for b in 0..padsize {
            let (ra, dec) = transform.pixel_to_world(
                b as f64 / o - over_median + px as f64,
                a as f64 / o - over_median + py as f64,
            );
            ras[[a, b]] = ra;
            decs[[a, b]] = dec;
        }
    }

    let dec_max = decs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let dec_min = decs.iter().copied().fold(f64::INFINITY, f64::min);
    let required = settings.spline_pixel_scale * (2 * settings.spline_radius + 1) as f64 * 1.05;
    if !(dec_max - dec_min > required) {
        return Err(FitError::MeshOverfillsPatch {
            image: label,
            dec_range: dec_max - dec_min,
            required,
        });
    }

    // Grid sample (a, b) sits at patch coordinate (a / o - over_median + p2, ...)
    let to_patch = |k: usize| k as f64 / o - over_median + p2 as f64;
    let rows: Vec<f64> = (0..padsize).flat_map(|a| std::iter::repeat(to_patch(a)).take(padsize)).collect();
    let cols: Vec<f64> = (0..padsize).flat_map(|_| (0..padsize).map(to_patch)).collect();
    let ra_flat: Vec<f64> = ras.iter().copied().collect();
    let dec_flat: Vec<f64> = decs.iter().copied().collect();
    let sky_to_patch = SkyToPatch::fit(&ra_flat, &dec_flat, &rows, &cols)?;

    let mut pixel_ras = Array2::zeros((patch, patch));
    let mut pixel_decs = Array2::zeros((patch, patch));
    for ((i, j), ra) in pixel_ras.indexed_iter_mut() {
        let (r, d) = transform.pixel_to_world((j as i64 - p2 + px) as f64, (i as i64 - p2 + py) as f64);
        *ra = r;
        pixel_decs[[i, j]] = d;
    }

    let row_range = (py - p2 - 1, py + p2);
    let col_range = (px - p2 - 1, px + p2);
    let pixel_range = [row_range.0, row_range.1, col_range.0, col_range.1];
    info!("{}: pixel range {:?}, MJD {}", label, pixel_range, mjd);

    let cut = |ext: &ExtensionId| -> Result<Array2<f64>> { Ok(robust_index(&source.array(ext)?, row_range, col_range, 0.0)) };
    let mut sci = cut(&image.sci_ext)?;
    let mut err = cut(&image.err_ext)?;
    let mut dq = cut(&image.dq_ext)?;
    let pixel_area = match pixel_area_map {
        Some(pam) => robust_index(pam, row_range, col_range, 1.0),
        None => Array2::ones((patch, patch)),
    };

    let mut bad = Array2::from_elem((patch, patch), false);
    for &(bx, by) in bad_pixels {
        let r = by as i64 - 1 - row_range.0;
        let c = bx as i64 - 1 - col_range.0;
        if (0..patch as i64).contains(&r) && (0..patch as i64).contains(&c) {
            bad[[r as usize, c as usize]] = true;
        }
    }

    apply_circular_window(&mut sci, &mut err, &mut dq, settings.apodize);

    let invvar = inverse_variance(&mut sci, &err, &dq, &bad, image.err_scale, &settings.okay_dqs);

    let patch_data = PatchData {
        label,
        sci,
        invvar,
        ras,
        decs,
        pixel_ras,
        pixel_decs,
        sky_to_patch,
        pixel_area,
        mjd,
        pixel_range,
        ra0: image.ra0,
        dec0: image.dec0,
        epoch: image.epoch,
    };
    if !patch_data.has_valid_pixels() {
        warn!("{}: no valid pixels in patch, image carries zero weight", patch_data.label);
    }
    Ok(patch_data)
}

/// Zero everything outside the inscribed circle; optionally feather the errors near its edge
fn apply_circular_window(sci: &mut Array2<f64>, err: &mut Array2<f64>, dq: &mut Array2<f64>, apodize: bool) {
    let p2 = (sci.nrows() / 2) as f64;
    let edge = p2 + 0.5;
    for ((i, j), s) in sci.indexed_iter_mut() {
        let r2 = (i as f64 - p2).powi(2) + (j as f64 - p2).powi(2);
        if r2 >= edge * edge {
            *s = 0.0;
            err[[i, j]] = 0.0;
            dq[[i, j]] = 0.0;
        } else if apodize {
            err[[i, j]] /= 1.0 - (r2.sqrt() / edge).powi(8);
        }
    }
}

/// `(err * err_scale)^-2` where the combined mask is clear; non-finite pixels become (0, 0)
fn inverse_variance(
    sci: &mut Array2<f64>,
    err: &Array2<f64>,
    dq: &Array2<f64>,
    bad: &Array2<bool>,
    err_scale: f64,
    okay_dqs: &[i64],
) -> Array2<f64> {
    let mut invvar = Array2::zeros(sci.dim());
    let mut n_bad = 0usize;
    for ((idx, w), s) in invvar.indexed_iter_mut().zip(sci.iter_mut()) {
        let flags = dq[idx];
        let mut masked = !flags.is_finite() || bad[idx];
        if !masked {
            let cleared = okay_dqs.iter().fold(flags as i64, |acc, ok| acc & !ok);
            masked = cleared != 0;
        }
        *w = if masked { 0.0 } else { (err[idx] * err_scale).powi(-2) };
        if !w.is_finite() || !s.is_finite() {
            *w = 0.0;
            *s = 0.0;
            n_bad += 1;
        }
    }
    if n_bad > 0 {
        debug!("{} non-finite pixels zeroed", n_bad);
    }
    invvar
}

/// 99th percentile (linear interpolation) of every science pixel across all patches
pub fn flux_scale(patches: &[PatchData]) -> f64 {
    let mut values: Vec<f64> = patches.iter().flat_map(|p| p.sci.iter().copied()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let pos = 0.99 * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
}

/// Open every exposure named in the settings and ingest its patch
pub fn load_patches(settings: &Settings, padsize: usize) -> Result<Vec<PatchData>> {
    settings
        .images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            info!("Image {} {}", i + 1, image.path.display());
            let source = FitsImage::open(&image.path)?;
            let pam = image
                .pixel_area_map
                .as_deref()
                .map(|p| read_extension(p, &ExtensionId::Index(1)))
                .transpose()?;
            let bad_pixels = match image.bad_pixel_list.as_deref() {
                Some(p) => read_bad_pixel_list(p)?,
                None => Vec::new(),
            };
            ingest(&source, image, pam.as_ref(), &bad_pixels, settings, padsize)
        })
        .collect()
}
