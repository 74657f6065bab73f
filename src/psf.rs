/// PSF preprocessing: frequency-domain kernels and subpixel rasters
///
/// Each distinct PSF file becomes one [`PsfEntry`]. Images refer to entries by
/// handle through [`PsfLibrary::entry_for_image`].
use ndarray::Array2;
use rustfft::num_complex::Complex64;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{FitError, Result};
use crate::fft::{convolve_spectra, next_power_of_two, Fft2d};
use crate::settings::Settings;
use crate::spline::QuadraticSpline;

const IMAG_TOLERANCE: f64 = 1e-8;

/// Geometry knobs that shape PSF preprocessing
#[derive(Debug, Clone, Copy)]
pub struct PsfConfig {
    pub patch: usize,
    pub oversample: usize,
    /// The raster already includes the detector pixel response
    pub psf_has_pix: bool,
}

impl From<&Settings> for PsfConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            patch: settings.patch,
            oversample: settings.oversample,
            psf_has_pix: settings.psf_has_pix,
        }
    }
}

/// Preprocessed PSF shared by every image that references the same file
#[derive(Debug, Clone)]
pub struct PsfEntry {
    pub name: String,
    /// FFT of the padded, recentred kernel (`padsize` x `padsize`)
    pub kernel: Array2<Complex64>,
    /// Odd-sized real raster with the peak at its centre
    pub subpixel: Array2<f64>,
    spline: QuadraticSpline,
}

impl PsfEntry {
    /// Render the point-source response on the detector grid for a source at
    /// fractional patch coordinates `(row, col)`
    pub fn pixelize(&self, row: f64, col: f64, patch: usize, oversample: usize) -> Array2<f64> {
        let o = oversample as f64;
        let half = (self.subpixel.nrows() / 2) as f64;
        let row_shift = row * o - half;
        let col_shift = col * o - half;
        Array2::from_shape_fn((patch, patch), |(m, n)| {
            self.spline.sample(m as f64 * o - row_shift, n as f64 * o - col_shift)
        })
    }
}

/// All preprocessed PSFs plus the per-image handle table
#[derive(Debug, Clone)]
pub struct PsfLibrary {
    pub padsize: usize,
    fft: Fft2d,
    entries: Vec<PsfEntry>,
    handles: Vec<usize>,
}

impl PsfLibrary {
    /// Build from in-memory rasters. `image_psfs[i]` names the raster used by image `i`.
    pub fn build(rasters: Vec<(PathBuf, Array2<f64>)>, image_psfs: &[PathBuf], config: PsfConfig) -> Result<Self> {
        let model_shape = config.patch * config.oversample;
        let largest = rasters
            .iter()
            .map(|(_, r)| r.nrows().max(r.ncols()))
            .max()
            .unwrap_or(0);
        let padsize = next_power_of_two(largest.max(model_shape));
        info!("PSF padsize {} (model shape {}, largest PSF {})", padsize, model_shape, largest);

        let fft = Fft2d::square(padsize);
        let mut index = HashMap::new();
        let mut entries = Vec::with_capacity(rasters.len());
        for (path, raster) in rasters {
            let name = path.display().to_string();
            let entry = preprocess(&name, &raster, &fft, config)?;
            index.insert(path, entries.len());
            entries.push(entry);
        }

        let handles = image_psfs
            .iter()
            .map(|p| {
                index.get(p).copied().ok_or_else(|| FitError::InvalidSetting {
                    key: "psfs",
                    message: format!("no raster loaded for {}", p.display()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            padsize,
            fft,
            entries,
            handles,
        })
    }

    pub fn fft(&self) -> &Fft2d {
        &self.fft
    }

    pub fn entries(&self) -> &[PsfEntry] {
        &self.entries
    }

    pub fn entry_for_image(&self, image: usize) -> &PsfEntry {
        &self.entries[self.handles[image]]
    }
}

/// Index of the single largest pixel; ties are fatal
fn unique_peak(name: &str, raster: &Array2<f64>) -> Result<(usize, usize)> {
    let max = raster.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut hits = raster.indexed_iter().filter(|(_, &v)| v == max);
    match (hits.next(), hits.next()) {
        (Some((idx, _)), None) => Ok(idx),
        _ => Err(FitError::AmbiguousPsfPeak(name.to_string())),
    }
}

/// First index holding the maximum, in raster order
fn argmax(raster: &Array2<f64>) -> (usize, usize) {
    let mut best = ((0, 0), f64::NEG_INFINITY);
    for (idx, &v) in raster.indexed_iter() {
        if v > best.1 {
            best = (idx, v);
        }
    }
    best.0
}

/// Place `raster` at the top-left of an `n` x `n` zero array
fn pad_top_left(raster: &Array2<f64>, n: usize) -> Array2<f64> {
    let mut out = Array2::zeros((n, n));
    let (h, w) = raster.dim();
    out.slice_mut(ndarray::s![..h.min(n), ..w.min(n)])
        .assign(&raster.slice(ndarray::s![..h.min(n), ..w.min(n)]));
    out
}

fn impulse(n: usize, row: isize, col: isize) -> Array2<f64> {
    let mut out = Array2::zeros((n, n));
    let n = n as isize;
    out[[row.rem_euclid(n) as usize, col.rem_euclid(n) as usize]] = 1.0;
    out
}

/// Convolve with an `oversample` x `oversample` top-hat anchored at the origin
fn add_pixel_response(raster: &Array2<f64>, fft: &Fft2d, oversample: usize) -> Array2<f64> {
    let n = raster.nrows();
    let k = oversample.min(n);
    let mut pixel = Array2::zeros((n, n));
    pixel.slice_mut(ndarray::s![..k, ..k]).fill(1.0);
    let (out, _) = convolve_spectra(fft, &fft.forward_real(raster), &fft.forward_real(&pixel));
    out
}

fn preprocess(name: &str, raster: &Array2<f64>, fft: &Fft2d, config: PsfConfig) -> Result<PsfEntry> {
    unique_peak(name, raster)?;
    let (h, w) = raster.dim();
    let padsize = fft.shape().0;
    info!("PSF {}: shape {}x{}", name, h, w);

    // Frequency-domain kernel
    let mut padded = pad_top_left(raster, padsize);
    if !config.psf_has_pix {
        debug!("Adding pixel convolution to {}", name);
        padded = add_pixel_response(&padded, fft, config.oversample);
    }
    let (pi, pj) = argmax(&padded);
    let shift = impulse(padsize, padsize as isize - pi as isize, padsize as isize - pj as isize);
    let kernel = &fft.forward_real(&padded) * &fft.forward_real(&shift);

    let mut check = kernel.clone();
    fft.inverse(&mut check);
    let max_imag = check.iter().fold(0.0_f64, |m, c| m.max(c.im.abs()));
    if max_imag >= IMAG_TOLERANCE {
        return Err(FitError::PsfCentering {
            name: name.to_string(),
            message: format!("imaginary residual {:.3e} after recentring", max_imag),
        });
    }
    let spatial = check.mapv(|c| c.re);
    let peak = spatial.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if spatial[[0, 0]] < peak - 1e-12 * peak.abs() {
        return Err(FitError::PsfCentering {
            name: name.to_string(),
            message: format!("recentred peak at {:?}, not at the origin", argmax(&spatial)),
        });
    }

    // Odd-sized subpixel raster
    let largest = h.max(w);
    let odd = if largest % 2 == 0 { largest + 1 } else { largest };
    let odd_fft = Fft2d::square(odd);
    let mut odd_padded = pad_top_left(raster, odd);
    if !config.psf_has_pix {
        odd_padded = add_pixel_response(&odd_padded, &odd_fft, config.oversample);
    }
    let (oi, oj) = argmax(&odd_padded);
    info!("PSF {}: odd padsize {}, peak at ({}, {})", name, odd, oi, oj);
    let shift = impulse(odd, (h / 2) as isize - oi as isize, (w / 2) as isize - oj as isize);
    let (subpixel, _) = convolve_spectra(&odd_fft, &odd_fft.forward_real(&odd_padded), &odd_fft.forward_real(&shift));

    Ok(PsfEntry {
        name: name.to_string(),
        kernel,
        spline: QuadraticSpline::new(&subpixel),
        subpixel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian(n: usize, ci: f64, cj: f64, sigma: f64) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| {
            let di = i as f64 - ci;
            let dj = j as f64 - cj;
            (-(di * di + dj * dj) / (2.0 * sigma * sigma)).exp()
        })
    }

    fn config(patch: usize, oversample: usize, psf_has_pix: bool) -> PsfConfig {
        PsfConfig {
            patch,
            oversample,
            psf_has_pix,
        }
    }

    fn spatial_kernel(lib: &PsfLibrary, image: usize) -> Array2<Complex64> {
        let mut k = lib.entry_for_image(image).kernel.clone();
        lib.fft().inverse(&mut k);
        k
    }

    #[test]
    fn test_kernel_peak_at_origin() {
        let psf = PathBuf::from("psf.fits");
        for &(ci, cj) in &[(7.0, 7.0), (3.2, 9.6), (11.0, 2.0)] {
            let raster = gaussian(15, ci, cj, 1.7);
            let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf.clone()], config(11, 2, true)).unwrap();
            assert_eq!(lib.padsize, 32);

            let k = spatial_kernel(&lib, 0);
            let max_imag = k.iter().fold(0.0_f64, |m, c| m.max(c.im.abs()));
            assert!(max_imag < 1e-8);
            let re = k.mapv(|c| c.re);
            assert_eq!(argmax(&re), (0, 0));
        }
    }

    #[test]
    fn test_kernel_with_pixel_response_passes_checks() {
        let psf = PathBuf::from("psf.fits");
        let raster = gaussian(15, 3.2, 9.6, 1.7);
        let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(11, 2, false)).unwrap();
        let re = spatial_kernel(&lib, 0).mapv(|c| c.re);
        assert_eq!(argmax(&re), (0, 0));
    }

    #[test]
    fn test_kernel_preserves_flux() {
        let psf = PathBuf::from("psf.fits");
        let raster = gaussian(9, 4.0, 4.0, 1.2);
        let total = raster.sum();
        let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(5, 1, true)).unwrap();
        let k = spatial_kernel(&lib, 0);
        assert_abs_diff_eq!(k.iter().map(|c| c.re).sum::<f64>(), total, epsilon = 1e-9);
    }

    #[test]
    fn test_pixel_response_scales_flux() {
        let psf = PathBuf::from("psf.fits");
        let raster = gaussian(9, 4.0, 4.0, 1.2);
        let total = raster.sum();
        let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(5, 3, false)).unwrap();
        let k = spatial_kernel(&lib, 0);
        assert_abs_diff_eq!(k.iter().map(|c| c.re).sum::<f64>(), 9.0 * total, epsilon = 1e-8);
    }

    #[test]
    fn test_subpixel_raster_is_odd_and_centred() {
        let psf = PathBuf::from("psf.fits");
        let raster = gaussian(16, 5.0, 10.0, 1.5);
        let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(5, 1, true)).unwrap();
        let sub = &lib.entry_for_image(0).subpixel;
        assert_eq!(sub.dim(), (17, 17));
        assert_eq!(argmax(sub), (8, 8));
    }

    #[test]
    fn test_ambiguous_peak_is_fatal() {
        let psf = PathBuf::from("flat.fits");
        let raster = Array2::from_elem((5, 5), 1.0);
        let err = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(5, 1, true)).unwrap_err();
        assert!(matches!(err, FitError::AmbiguousPsfPeak(_)));
    }

    #[test]
    fn test_shared_handles() {
        let a = PathBuf::from("a.fits");
        let b = PathBuf::from("b.fits");
        let lib = PsfLibrary::build(
            vec![(a.clone(), gaussian(7, 3.0, 3.0, 1.0)), (b.clone(), gaussian(7, 3.0, 3.0, 2.0))],
            &[a.clone(), b.clone(), a.clone()],
            config(5, 1, true),
        )
        .unwrap();
        assert_eq!(lib.entries().len(), 2);
        assert_eq!(lib.entry_for_image(0).name, lib.entry_for_image(2).name);
        assert_ne!(lib.entry_for_image(0).name, lib.entry_for_image(1).name);
    }

    #[test]
    fn test_pixelize_delta_psf() {
        let psf = PathBuf::from("delta.fits");
        let lib = PsfLibrary::build(vec![(psf.clone(), Array2::from_elem((1, 1), 1.0))], &[psf], config(7, 1, true)).unwrap();
        let rendered = lib.entry_for_image(0).pixelize(3.0, 2.0, 7, 1);
        assert_abs_diff_eq!(rendered[[3, 2]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rendered.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pixelize_oversampled_centroid_and_sum() {
        let psf = PathBuf::from("gauss.fits");
        let raster = gaussian(25, 12.0, 12.0, 2.5);
        let total = raster.sum();
        let lib = PsfLibrary::build(vec![(psf.clone(), raster)], &[psf], config(9, 3, true)).unwrap();
        let entry = lib.entry_for_image(0);
        assert_eq!(entry.subpixel.dim(), (25, 25));

        let rendered = entry.pixelize(4.4, 4.0, 9, 3);
        let sum = rendered.sum();
        // One detector sample per 3x3 subpixels
        assert_abs_diff_eq!(sum, total / 9.0, epsilon = 1e-2 * total / 9.0);

        let (mut row, mut col) = (0.0, 0.0);
        for ((m, n), &v) in rendered.indexed_iter() {
            row += m as f64 * v;
            col += n as f64 * v;
        }
        assert_abs_diff_eq!(row / sum, 4.4, epsilon = 0.02);
        assert_abs_diff_eq!(col / sum, 4.0, epsilon = 0.02);
        assert_eq!(argmax(&rendered), (4, 4));
    }
}
