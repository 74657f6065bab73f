/// Fit orchestration: staged solver calls, the outer convergence loop and the
/// final model products.
///
/// Each outer iteration runs
/// 1. galaxy + transient flux (one solver iteration, sparse Jacobian),
/// 2. astrometric offsets, either image by image (`iterative_centroid`) or jointly,
///    followed in the joint case by a fit of everything at once,
///
/// and then decides with [`ConvergenceMonitor`] whether to stop.
use nalgebra::DMatrix;
use ndarray::{Array2, Zip};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FitError, Result};
use crate::model::{ModelEvaluator, RenderMode};
use crate::params::{ParameterLayout, ParameterRecord, Segment};
use crate::pulls::{chi2, pull_image, pulls_for_vector};
use crate::solver::{JacobianMode, LeastSquaresSolver, SolveRequest, SolverOutcome};

/// Step scale of the astrometric offsets, degrees
const OFFSET_SCALE: f64 = 0.1;
const CENTROID_ITERATIONS: usize = 3;
const CHI2_TOLERANCE: f64 = 0.01;
const FLUX_RATIO_TOLERANCE: f64 = 1e-4;

/// Why the outer loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    IterationCap,
    /// Galaxy-only fit: chi2 improved by less than the tolerance
    Chi2Converged,
    /// Transient fluxes changed by less than the ratio tolerance
    FluxConverged,
}

/// Outer-loop stopping rule
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    n_iter: usize,
    iteration: usize,
    chi2: f64,
    last_chi2: f64,
    last_flux: Vec<f64>,
}

impl ConvergenceMonitor {
    pub fn new(n_iter: usize, n_epoch: usize) -> Self {
        Self {
            n_iter,
            iteration: 0,
            chi2: 1e100,
            last_chi2: 1e101,
            last_flux: vec![-2.0; n_epoch],
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Remember the state going into an iteration
    pub fn begin(&mut self, flux: &[f64]) {
        self.last_chi2 = self.chi2;
        self.last_flux = flux.to_vec();
    }

    /// Record the outcome of an iteration; `Some` when the loop should stop
    pub fn finish(&mut self, chi2: f64, flux: &[f64]) -> Option<StopReason> {
        self.chi2 = chi2;
        self.iteration += 1;

        if self.iteration >= self.n_iter {
            info!("Reached maximum iterations");
            return Some(StopReason::IterationCap);
        }
        if flux.is_empty() {
            if self.last_chi2 - chi2 < CHI2_TOLERANCE {
                info!("Chi^2 converged for galaxy-only run");
                return Some(StopReason::Chi2Converged);
            }
            return None;
        }

        let floor = self.last_flux.iter().copied().fold(f64::NEG_INFINITY, f64::max).abs();
        let ratios: Vec<f64> = flux
            .iter()
            .zip(&self.last_flux)
            .map(|(new, old)| ((new.abs() + floor) / (old.abs() + floor)).abs())
            .collect();
        if ratios.iter().any(|r| !r.is_finite()) {
            debug!("Flux ratio undefined, continuing");
            return None;
        }
        let ratio = ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        info!("Flux ratio {}", ratio);
        ((ratio - 1.0).abs() < FLUX_RATIO_TOLERANCE).then_some(StopReason::FluxConverged)
    }
}

/// Per-image arrays derived from the final record
#[derive(Debug, Clone)]
pub struct FitProducts {
    pub models: Vec<Array2<f64>>,
    /// `(data - model)` where the weight is positive, else 0
    pub residuals: Vec<Array2<f64>>,
    /// `(data - model) * sqrt(invvar)`
    pub pulls: Vec<Array2<f64>>,
    pub pt_models: Vec<Array2<f64>>,
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub record: ParameterRecord,
    pub chi2: f64,
    pub iterations: usize,
    pub stop: StopReason,
    /// Covariance of the stage used for reporting, over `covariance_active`
    pub covariance: Option<DMatrix<f64>>,
    pub covariance_active: Vec<usize>,
    /// Flux block, `n_epoch` x `n_epoch`; zeros when degenerate
    pub flux_covariance: DMatrix<f64>,
    pub covariance_degenerate: bool,
    pub products: FitProducts,
}

impl FitResult {
    /// Number of fitted parameters behind the reported covariance
    pub fn n_fit_params(&self) -> usize {
        self.covariance_active.len()
    }
}

/// Covariance from the most recent stage that moved the fluxes
#[derive(Debug, Clone, Default)]
struct TrackedCovariance {
    matrix: Option<DMatrix<f64>>,
    active: Vec<usize>,
}

pub struct FitOrchestrator<'a> {
    evaluator: &'a ModelEvaluator<'a>,
    solver: &'a dyn LeastSquaresSolver,
    layout: ParameterLayout,
    flux_scale: f64,
}

impl<'a> FitOrchestrator<'a> {
    pub fn new(evaluator: &'a ModelEvaluator<'a>, solver: &'a dyn LeastSquaresSolver, flux_scale: f64) -> Self {
        Self {
            evaluator,
            solver,
            layout: ParameterLayout::from_settings(evaluator.settings()),
            flux_scale,
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    fn all_images(&self) -> Vec<usize> {
        (0..self.layout.n_img).collect()
    }

    fn solve(
        &self,
        record: &ParameterRecord,
        scales: Vec<f64>,
        max_iterations: usize,
        jacobian: JacobianMode,
        images: Vec<usize>,
    ) -> Result<(ParameterRecord, SolverOutcome)> {
        let request = SolveRequest {
            start: self.layout.unparse(record),
            scales,
            max_iterations,
            jacobian,
            images,
        };
        let residuals = |p: &[f64], images: &[usize]| pulls_for_vector(self.evaluator, &self.layout, p, images);
        let outcome = self.solver.minimize(&request, &residuals)?;
        let record = self.layout.parse(&outcome.params)?;
        Ok((record, outcome))
    }

    fn transient_offset_scale(&self) -> f64 {
        if self.evaluator.settings().fit_sn_offset {
            OFFSET_SCALE
        } else {
            0.0
        }
    }

    /// One pass of the staged fit. Returns the new record and the latest
    /// covariance whose active set includes every flux parameter.
    fn staged_fit(&self, record: &ParameterRecord) -> Result<(ParameterRecord, Option<TrackedCovariance>)> {
        let flux_range = self.layout.range(Segment::Flux);
        let mut tracked = None;
        let mut track = |outcome: &SolverOutcome| {
            if flux_range.clone().all(|k| outcome.active.contains(&k)) {
                tracked = Some(TrackedCovariance {
                    matrix: outcome.covariance.clone(),
                    active: outcome.active.clone(),
                });
            }
        };

        info!("Running galaxy+transient fit {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        let start = Instant::now();
        let flux_scale = self.flux_scale;
        let scales = self.layout.scale_vector(|s| match s {
            Segment::Coefficients => 1.0,
            Segment::Flux => flux_scale,
            _ => 0.0,
        });
        let (mut record, outcome) = self.solve(record, scales, 1, JacobianMode::Sparse, self.all_images())?;
        track(&outcome);
        info!(
            "Done in {:.2} s, LM chi^2 {:.2}",
            start.elapsed().as_secs_f64(),
            outcome.cost
        );

        let settings = self.evaluator.settings();
        if settings.iterative_centroid {
            let ra = self.layout.range(Segment::ImageDeltaRa);
            let dec = self.layout.range(Segment::ImageDeltaDec);
            for i in 0..self.layout.n_img {
                info!("Centroiding {} of {}", i + 1, self.layout.n_img);
                let mut scales = vec![0.0; self.layout.len()];
                scales[ra.start + i] = OFFSET_SCALE;
                scales[dec.start + i] = OFFSET_SCALE;
                let (next, outcome) = self.solve(&record, scales, CENTROID_ITERATIONS, JacobianMode::Dense, vec![i])?;
                track(&outcome);
                record = next;
            }
        } else {
            let sn_scale = self.transient_offset_scale();
            let offsets = |s: Segment| match s {
                Segment::ImageDeltaRa | Segment::ImageDeltaDec => OFFSET_SCALE,
                Segment::TransientDeltaRa | Segment::TransientDeltaDec => sn_scale,
                _ => 0.0,
            };

            info!("Running centroid-only fit {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
            let scales = self.layout.scale_vector(offsets);
            let (next, outcome) =
                self.solve(&record, scales, CENTROID_ITERATIONS, JacobianMode::Dense, self.all_images())?;
            track(&outcome);
            info!("LM chi^2 {:.2}", outcome.cost);
            record = next;

            info!("Running everything fit {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
            let start = Instant::now();
            let scales = self.layout.scale_vector(|s| match s {
                Segment::Coefficients | Segment::Flux => flux_scale,
                other => offsets(other),
            });
            let (next, outcome) =
                self.solve(&record, scales, CENTROID_ITERATIONS, JacobianMode::Sparse, self.all_images())?;
            track(&outcome);
            info!(
                "Done in {:.2} s, LM chi^2 {:.2}",
                start.elapsed().as_secs_f64(),
                outcome.cost
            );
            record = next;
        }

        Ok((record, tracked))
    }

    /// Run outer iterations from `initial` until the monitor says stop
    pub fn run(&self, initial: ParameterRecord) -> Result<FitResult> {
        let settings = self.evaluator.settings();
        let mut monitor = ConvergenceMonitor::new(settings.n_iter, self.layout.n_epoch);
        let mut record = initial;
        let mut tracked = TrackedCovariance::default();

        let (stop, chi2_now) = loop {
            monitor.begin(&record.flux);
            info!("Running LM fit for iteration {} of {}", monitor.iteration() + 1, settings.n_iter);

            let (next, cov) = self.staged_fit(&record)?;
            record = next;
            if let Some(cov) = cov {
                tracked = cov;
            }

            let chi2_now = chi2(self.evaluator, &record);
            info!("chi^2 check for iter {} after centroid {:.2}", monitor.iteration() + 1, chi2_now);

            if let Some(reason) = monitor.finish(chi2_now, &record.flux) {
                break (reason, chi2_now);
            }
        };
        if monitor.iteration() == 0 {
            return Err(FitError::NoIterations);
        }

        let (flux_covariance, covariance_degenerate) = self.flux_block(&tracked);
        let products = self.products(&record);

        Ok(FitResult {
            record,
            chi2: chi2_now,
            iterations: monitor.iteration(),
            stop,
            covariance: tracked.matrix,
            covariance_active: tracked.active,
            flux_covariance,
            covariance_degenerate,
            products,
        })
    }

    /// Flux rows and columns of the tracked covariance, mapped through its active set
    fn flux_block(&self, tracked: &TrackedCovariance) -> (DMatrix<f64>, bool) {
        let n = self.layout.n_epoch;
        let positions: Option<Vec<usize>> = self
            .layout
            .range(Segment::Flux)
            .map(|k| tracked.active.iter().position(|&a| a == k))
            .collect();

        match (&tracked.matrix, positions) {
            (Some(cov), Some(pos)) => (DMatrix::from_fn(n, n, |a, b| cov[(pos[a], pos[b])]), false),
            _ => {
                warn!("Covariance is degenerate; reporting zero flux covariance");
                (DMatrix::zeros(n, n), true)
            }
        }
    }

    fn products(&self, record: &ParameterRecord) -> FitProducts {
        let patches = self.evaluator.patches();
        let models = self.evaluator.render_all(record, RenderMode::Full);
        let residuals = models
            .iter()
            .zip(patches)
            .map(|(m, p)| {
                let mut r = Array2::zeros(m.dim());
                Zip::from(&mut r)
                    .and(&p.sci)
                    .and(m)
                    .and(&p.invvar)
                    .for_each(|r, &d, &m, &w| *r = if w > 0.0 { d - m } else { 0.0 });
                r
            })
            .collect();
        let pulls = models
            .iter()
            .zip(patches)
            .map(|(m, p)| pull_image(&p.sci, m, &p.invvar))
            .collect();
        let pt_models = self.evaluator.render_all(record, RenderMode::PointSourceOnly);
        FitProducts {
            models,
            residuals,
            pulls,
            pt_models,
        }
    }
}
