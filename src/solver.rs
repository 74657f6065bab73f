/// Nonlinear least squares behind a strategy trait
///
/// The orchestrator only talks to [`LeastSquaresSolver`]; [`LevenbergMarquardt`]
/// is the bundled implementation. Parameters whose step scale is zero are frozen
/// and excluded from the Jacobian and from the covariance.
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::error::{FitError, Result};

/// How the Jacobian is stored while forming the normal equations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMode {
    Dense,
    /// Columns keep only their nonzero entries
    Sparse,
}

/// One minimisation problem
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub start: Vec<f64>,
    /// Finite-difference scale per parameter; 0 freezes the parameter
    pub scales: Vec<f64>,
    pub max_iterations: usize,
    pub jacobian: JacobianMode,
    /// Auxiliary data handed to the residual function (image indices)
    pub images: Vec<usize>,
}

impl SolveRequest {
    /// Indices of parameters that are allowed to move
    pub fn active(&self) -> Vec<usize> {
        self.scales
            .iter()
            .enumerate()
            .filter(|(_, &s)| s != 0.0)
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub params: Vec<f64>,
    /// Sum of squared residuals at `params`
    pub cost: f64,
    /// `(J^T J)^-1` over the active parameters, `None` when singular
    pub covariance: Option<DMatrix<f64>>,
    /// Full-vector index of each covariance row
    pub active: Vec<usize>,
    pub iterations: usize,
}

/// Residual callback: parameter vector and image list to residual vector
pub type ResidualFn<'a> = dyn Fn(&[f64], &[usize]) -> Result<Vec<f64>> + 'a;

pub trait LeastSquaresSolver {
    fn minimize(&self, request: &SolveRequest, residuals: &ResidualFn) -> Result<SolverOutcome>;
}

/// Levenberg-Marquardt with forward-difference Jacobians and Marquardt damping
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    lambda: f64,
    lambda_factor: f64,
    max_lambda: f64,
    tolerance: f64,
    /// Finite-difference step as a fraction of each parameter's scale
    step_fraction: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            lambda: 1e-3,
            lambda_factor: 10.0,
            max_lambda: 1e10,
            tolerance: 1e-10,
            step_fraction: 1e-5,
        }
    }
}

/// `J^T J` and `J^T r` over the active parameters
struct NormalEquations {
    jtj: DMatrix<f64>,
    jtr: DVector<f64>,
}

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

/// Dot product of two sparse columns with sorted indices
fn sparse_dot(a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
    let (mut i, mut j, mut acc) = (0, 0, 0.0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                acc += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    acc
}

impl LevenbergMarquardt {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Forward-difference Jacobian column for parameter `k`
    fn column(
        &self,
        params: &[f64],
        base: &[f64],
        k: usize,
        request: &SolveRequest,
        residuals: &ResidualFn,
    ) -> Result<Vec<f64>> {
        let h = request.scales[k] * self.step_fraction;
        let mut shifted = params.to_vec();
        shifted[k] += h;
        let r = residuals(&shifted, &request.images)?;
        if r.len() != base.len() {
            return Err(FitError::Solver(format!(
                "residual length changed from {} to {}",
                base.len(),
                r.len()
            )));
        }
        Ok(r.iter().zip(base).map(|(a, b)| (a - b) / h).collect())
    }

    fn normal_equations(
        &self,
        params: &[f64],
        base: &[f64],
        active: &[usize],
        request: &SolveRequest,
        residuals: &ResidualFn,
    ) -> Result<NormalEquations> {
        let n = active.len();
        let r = DVector::from_column_slice(base);
        match request.jacobian {
            JacobianMode::Dense => {
                let mut jacobian = DMatrix::<f64>::zeros(base.len(), n);
                for (c, &k) in active.iter().enumerate() {
                    let col = self.column(params, base, k, request, residuals)?;
                    jacobian.set_column(c, &DVector::from_vec(col));
                }
                Ok(NormalEquations {
                    jtj: jacobian.tr_mul(&jacobian),
                    jtr: jacobian.tr_mul(&r),
                })
            }
            JacobianMode::Sparse => {
                let mut columns = Vec::with_capacity(n);
                for &k in active {
                    let col = self.column(params, base, k, request, residuals)?;
                    let sparse: Vec<(usize, f64)> = col.into_iter().enumerate().filter(|(_, v)| *v != 0.0).collect();
                    columns.push(sparse);
                }
                let nnz: usize = columns.iter().map(|c| c.len()).sum();
                debug!("Sparse Jacobian: {} nonzeros in {} x {}", nnz, base.len(), n);

                let mut jtj = DMatrix::<f64>::zeros(n, n);
                for a in 0..n {
                    for b in a..n {
                        let v = sparse_dot(&columns[a], &columns[b]);
                        jtj[(a, b)] = v;
                        jtj[(b, a)] = v;
                    }
                }
                let jtr = DVector::from_iterator(n, columns.iter().map(|c| c.iter().map(|&(i, v)| v * base[i]).sum()));
                Ok(NormalEquations { jtj, jtr })
            }
        }
    }

    /// `(J^T J)^-1`, with parameters that have no leverage given zero rows and columns
    fn covariance(jtj: &DMatrix<f64>) -> Option<DMatrix<f64>> {
        let n = jtj.nrows();
        let live: Vec<usize> = (0..n).filter(|&i| jtj[(i, i)] > 0.0).collect();
        if live.len() < n {
            warn!("{} of {} parameters have no leverage on the residuals", n - live.len(), n);
        }
        let sub = DMatrix::from_fn(live.len(), live.len(), |a, b| jtj[(live[a], live[b])]);
        let inv = sub.try_inverse()?;
        if inv.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let mut cov = DMatrix::zeros(n, n);
        for (a, &ia) in live.iter().enumerate() {
            for (b, &ib) in live.iter().enumerate() {
                cov[(ia, ib)] = inv[(a, b)];
            }
        }
        Some(cov)
    }
}

impl LeastSquaresSolver for LevenbergMarquardt {
    fn minimize(&self, request: &SolveRequest, residuals: &ResidualFn) -> Result<SolverOutcome> {
        if request.scales.len() != request.start.len() {
            return Err(FitError::Solver(format!(
                "{} scales for {} parameters",
                request.scales.len(),
                request.start.len()
            )));
        }
        let active = request.active();
        let mut params = request.start.clone();
        let mut r = residuals(&params, &request.images)?;
        let mut cost = sum_sq(&r);
        if !cost.is_finite() {
            return Err(FitError::Solver("non-finite cost at the starting point".to_string()));
        }
        if active.is_empty() {
            return Ok(SolverOutcome {
                params,
                cost,
                covariance: None,
                active,
                iterations: 0,
            });
        }

        let mut lambda = self.lambda;
        // Normal equations at the current parameters, if still valid
        let mut current: Option<NormalEquations> = None;
        let mut iterations = 0;

        while iterations < request.max_iterations {
            iterations += 1;
            let normal = self.normal_equations(&params, &r, &active, request, residuals)?;
            let rhs = -&normal.jtr;

            let mut accepted = None;
            loop {
                let mut h = normal.jtj.clone();
                for i in 0..active.len() {
                    let d = normal.jtj[(i, i)];
                    h[(i, i)] += lambda * if d > 0.0 { d } else { 1.0 };
                }

                if let Some(delta) = h.lu().solve(&rhs).filter(|d| d.iter().all(|v| v.is_finite())) {
                    let mut trial = params.clone();
                    for (c, &k) in active.iter().enumerate() {
                        trial[k] += delta[c];
                    }
                    let trial_r = residuals(&trial, &request.images)?;
                    let trial_cost = sum_sq(&trial_r);
                    if trial_cost.is_finite() && trial_cost < cost {
                        lambda /= self.lambda_factor;
                        accepted = Some((trial, trial_r, trial_cost));
                        break;
                    }
                }

                lambda *= self.lambda_factor;
                if lambda > self.max_lambda {
                    break;
                }
            }

            match accepted {
                Some((trial, trial_r, trial_cost)) => {
                    let improvement = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                    debug!("LM iteration {}: cost {:.6} -> {:.6}, lambda {:.1e}", iterations, cost, trial_cost, lambda);
                    params = trial;
                    r = trial_r;
                    cost = trial_cost;
                    current = None;
                    if cost == 0.0 || improvement < self.tolerance {
                        break;
                    }
                }
                None => {
                    debug!("LM iteration {}: no downhill step, lambda {:.1e}", iterations, lambda);
                    current = Some(normal);
                    break;
                }
            }
        }

        let normal = match current {
            Some(n) => n,
            None => self.normal_equations(&params, &r, &active, request, residuals)?,
        };
        let covariance = Self::covariance(&normal.jtj);
        if covariance.is_none() {
            warn!("Covariance is singular for {} active parameters", active.len());
        }

        Ok(SolverOutcome {
            params,
            cost,
            covariance,
            active,
            iterations,
        })
    }
}
