/// Forward model of one image patch
///
/// galaxy mesh -> quadratic spline on the oversampled sky grid -> PSF convolution
/// -> detector sampling, plus the PSF-shaped transient and an analytic sky level.
use ndarray::{s, Array2, Zip};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{FitError, Result};
use crate::params::ParameterRecord;
use crate::patch::PatchData;
use crate::psf::PsfLibrary;
use crate::settings::Settings;
use crate::spline::QuadraticSpline;

/// Which terms to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Galaxy, transient and sky
    Full,
    /// Transient alone; zero for reference-epoch images
    PointSourceOnly,
}

/// Inverse-variance weighted mean of `data - model`; 0 when no pixel has weight
pub fn sky_estimate(data: &Array2<f64>, model: &Array2<f64>, invvar: &Array2<f64>) -> f64 {
    let total_weight: f64 = invvar.sum();
    if !invvar.iter().any(|&w| w != 0.0) || total_weight == 0.0 {
        return 0.0;
    }
    let mut weighted = 0.0;
    Zip::from(data).and(model).and(invvar).for_each(|&d, &m, &w| {
        weighted += (d - m) * w;
    });
    weighted / total_weight
}

/// Renders model patches for any subset of images on a fixed-size worker pool
pub struct ModelEvaluator<'a> {
    settings: &'a Settings,
    patches: &'a [PatchData],
    psfs: &'a PsfLibrary,
    pool: ThreadPool,
}

impl<'a> ModelEvaluator<'a> {
    pub fn new(settings: &'a Settings, patches: &'a [PatchData], psfs: &'a PsfLibrary) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.n_cpu)
            .build()
            .map_err(|e| FitError::InvalidSetting {
                key: "n_cpu",
                message: e.to_string(),
            })?;
        debug!("Model evaluator using {} threads", settings.n_cpu);
        Ok(Self {
            settings,
            patches,
            psfs,
            pool,
        })
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    pub fn patches(&self) -> &[PatchData] {
        self.patches
    }

    pub fn psfs(&self) -> &PsfLibrary {
        self.psfs
    }

    /// Render `images` in parallel; output order follows `images`
    pub fn render(&self, record: &ParameterRecord, images: &[usize], mode: RenderMode) -> Vec<Array2<f64>> {
        let galaxy = match mode {
            RenderMode::Full => Some(QuadraticSpline::new(&record.coeffs)),
            RenderMode::PointSourceOnly => None,
        };
        self.pool.install(|| {
            images
                .par_iter()
                .map(|&i| match &galaxy {
                    Some(spline) => self.render_full(record, spline, i),
                    None => self
                        .point_source(record, i)
                        .unwrap_or_else(|| Array2::zeros((self.settings.patch, self.settings.patch))),
                })
                .collect()
        })
    }

    /// Render every image
    pub fn render_all(&self, record: &ParameterRecord, mode: RenderMode) -> Vec<Array2<f64>> {
        let all: Vec<usize> = (0..self.patches.len()).collect();
        self.render(record, &all, mode)
    }

    fn render_full(&self, record: &ParameterRecord, galaxy: &QuadraticSpline, i: usize) -> Array2<f64> {
        let patch = &self.patches[i];
        let mut model = self.convolved_galaxy(record, galaxy, i);
        if let Some(pt) = self.point_source(record, i) {
            model += &pt;
        }
        let sky = sky_estimate(&patch.sci, &model, &patch.invvar);
        model += sky;
        model
    }

    /// Galaxy surface sampled on the oversampled grid, convolved and sampled at detector pixels
    fn convolved_galaxy(&self, record: &ParameterRecord, galaxy: &QuadraticSpline, i: usize) -> Array2<f64> {
        let patch = &self.patches[i];
        let settings = self.settings;
        let radius = settings.spline_radius as f64;
        let dec_scale = patch.dec0.to_radians().cos();
        let ra_ref = patch.ra0 + record.d_ra[i];
        let dec_ref = patch.dec0 + record.d_dec[i];

        let mut surface = Array2::zeros(patch.ras.dim());
        Zip::from(&mut surface)
            .and(&patch.ras)
            .and(&patch.decs)
            .for_each(|v, &ra, &dec| {
                let x = (ra - ra_ref) * dec_scale / settings.spline_pixel_scale + radius;
                let y = (dec - dec_ref) / settings.spline_pixel_scale + radius;
                *v = galaxy.sample(x, y);
            });

        let fft = self.psfs.fft();
        let mut spectrum = fft.forward_real(&surface);
        spectrum *= &self.psfs.entry_for_image(i).kernel;
        fft.inverse(&mut spectrum);

        let o = settings.oversample as isize;
        let o2 = settings.oversample2() as isize;
        let n = settings.patch;
        spectrum
            .slice(s![o2..;o, o2..;o])
            .slice(s![..n, ..n])
            .mapv(|c| c.re)
    }

    /// Transient contribution, `None` for reference-epoch images
    fn point_source(&self, record: &ParameterRecord, i: usize) -> Option<Array2<f64>> {
        let patch = &self.patches[i];
        let flux = record.epoch_flux(patch.epoch)?;
        let (row, col) = patch
            .sky_to_patch
            .locate(record.point_ra(patch.ra0, i), record.point_dec(patch.dec0, i));
        let psf = self
            .psfs
            .entry_for_image(i)
            .pixelize(row, col, self.settings.patch, self.settings.oversample);
        Some(psf / &patch.pixel_area * flux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::InMemoryImage;
    use crate::params::ParameterLayout;
    use crate::patch::ingest;
    use crate::psf::PsfConfig;
    use crate::settings::{synthetic_settings, ExtensionId};
    use crate::wcs::TanWcs;
    use approx::assert_abs_diff_eq;
    use serde_json::json;
    use std::path::PathBuf;

    const ARCSEC: f64 = 1.0 / 3600.0;

    fn setup(settings: &Settings, sci: Array2<f64>) -> (Vec<PatchData>, PsfLibrary) {
        let psf = PathBuf::from("psf.fits");
        let mut delta = Array2::zeros((3, 3));
        delta[[1, 1]] = 1.0;
        let lib = PsfLibrary::build(
            vec![(psf.clone(), delta)],
            &vec![psf; settings.n_img()],
            PsfConfig::from(settings),
        )
        .unwrap();
        let wcs = TanWcs::new([16.0, 16.0], [150.0, 2.0], [[-ARCSEC, 0.0], [0.0, ARCSEC]]).unwrap();
        let img = InMemoryImage::new("synthetic", wcs)
            .with_array(&ExtensionId::Name("SCI".into()), sci)
            .with_array(&ExtensionId::Name("ERR".into()), Array2::ones((31, 31)))
            .with_array(&ExtensionId::Name("DQ".into()), Array2::zeros((31, 31)));
        let patches = settings
            .images
            .iter()
            .map(|im| ingest(&img, im, None, &[], settings, lib.padsize).unwrap())
            .collect();
        (patches, lib)
    }

    fn zero_record(settings: &Settings) -> ParameterRecord {
        let layout = ParameterLayout::from_settings(settings);
        layout.parse(&vec![0.0; layout.len()]).unwrap()
    }

    #[test]
    fn test_sky_estimate_is_zero_for_exact_model() {
        let data = Array2::from_shape_fn((5, 5), |(i, j)| (i * j) as f64);
        let mut invvar = Array2::ones((5, 5));
        invvar[[0, 0]] = 0.0;
        let mut model = data.clone();
        // Zero-weight pixels do not matter
        model[[0, 0]] = 1e6;
        assert_eq!(sky_estimate(&data, &model, &invvar), 0.0);
    }

    #[test]
    fn test_sky_estimate_weighted_mean() {
        let data = Array2::from_elem((2, 2), 10.0);
        let model = Array2::from_shape_vec((2, 2), vec![9.0, 9.0, 7.0, 7.0]).unwrap();
        let invvar = Array2::from_shape_vec((2, 2), vec![1.0, 1.0, 2.0, 0.0]).unwrap();
        // (1 + 1 + 3*2) / 4
        assert_abs_diff_eq!(sky_estimate(&data, &model, &invvar), 2.0, epsilon = 1e-12);
        assert_eq!(sky_estimate(&data, &model, &Array2::zeros((2, 2))), 0.0);
    }

    #[test]
    fn test_flat_scene_is_absorbed_by_sky() {
        let settings = synthetic_settings(json!({}));
        let (patches, lib) = setup(&settings, Array2::from_elem((31, 31), 100.0));
        let eval = ModelEvaluator::new(&settings, &patches, &lib).unwrap();
        let models = eval.render_all(&zero_record(&settings), RenderMode::Full);
        assert_eq!(models.len(), 1);
        for ((i, j), &w) in patches[0].invvar.indexed_iter() {
            if w > 0.0 {
                assert_abs_diff_eq!(models[0][[i, j]], 100.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_point_source_lands_on_centre() {
        let settings = synthetic_settings(json!({}));
        let (patches, lib) = setup(&settings, Array2::zeros((31, 31)));
        let eval = ModelEvaluator::new(&settings, &patches, &lib).unwrap();
        let mut record = zero_record(&settings);
        record.flux[0] = 50.0;

        let pt = eval.render_all(&record, RenderMode::PointSourceOnly);
        assert_abs_diff_eq!(pt[0][[5, 5]], 50.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pt[0].sum(), 50.0, epsilon = 1e-6);

        // Shift the transient one arcsec north: one row down
        record.sn_d_dec = ARCSEC;
        let pt = eval.render_all(&record, RenderMode::PointSourceOnly);
        assert_abs_diff_eq!(pt[0][[6, 5]], 50.0, epsilon = 1e-3);
    }

    #[test]
    fn test_reference_epoch_has_no_point_source() {
        let settings = synthetic_settings(json!({ "images": ["a.fits", "b.fits"], "epochs": [0, 1] }));
        let (patches, lib) = setup(&settings, Array2::zeros((31, 31)));
        let eval = ModelEvaluator::new(&settings, &patches, &lib).unwrap();
        let mut record = zero_record(&settings);
        record.flux[0] = 10.0;

        let pt = eval.render(&record, &[1, 0], RenderMode::PointSourceOnly);
        assert_abs_diff_eq!(pt[0].sum(), 10.0, epsilon = 1e-6);
        assert_eq!(pt[1].sum(), 0.0);
    }

    #[test]
    fn test_galaxy_mesh_renders_inside_circle() {
        let settings = synthetic_settings(json!({}));
        let (patches, lib) = setup(&settings, Array2::zeros((31, 31)));
        let eval = ModelEvaluator::new(&settings, &patches, &lib).unwrap();
        let mut record = zero_record(&settings);
        // Centre cell of the 5x5 mesh sits on the reference position
        record.coeffs[[2, 2]] = 7.0;
        let spline = QuadraticSpline::new(&record.coeffs);
        let galaxy = eval.convolved_galaxy(&record, &spline, 0);
        assert_abs_diff_eq!(galaxy[[5, 5]], 7.0, epsilon = 1e-6);
        // Patch corner lies on the mesh corner, which is outside the active circle
        assert_abs_diff_eq!(galaxy[[0, 0]], 0.0, epsilon = 1e-9);
    }
}
