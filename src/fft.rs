//! Two-dimensional FFTs on `ndarray` arrays.
//!
//! Rows are transformed in one batched call, columns via a transpose. The inverse
//! transform is normalised so that `ifft2(fft2(x)) == x`.

use ndarray::Array2;
use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use std::sync::Arc;

/// Cached forward/inverse plans for one array shape
#[derive(Clone)]
pub struct Fft2d {
    rows: usize,
    cols: usize,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl Fft2d {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            rows,
            cols,
            row_forward: planner.plan_fft_forward(cols),
            row_inverse: planner.plan_fft_inverse(cols),
            col_forward: planner.plan_fft_forward(rows),
            col_inverse: planner.plan_fft_inverse(rows),
        }
    }

    pub fn square(n: usize) -> Self {
        Self::new(n, n)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Forward transform of a real array
    pub fn forward_real(&self, input: &Array2<f64>) -> Array2<Complex64> {
        let mut data = input.mapv(|v| Complex64::new(v, 0.0));
        self.forward(&mut data);
        data
    }

    /// In-place forward transform
    pub fn forward(&self, data: &mut Array2<Complex64>) {
        self.transform(data, &self.row_forward, &self.col_forward);
    }

    /// In-place normalised inverse transform
    pub fn inverse(&self, data: &mut Array2<Complex64>) {
        self.transform(data, &self.row_inverse, &self.col_inverse);
        let norm = 1.0 / (self.rows * self.cols) as f64;
        data.mapv_inplace(|v| v * norm);
    }

    fn transform(&self, data: &mut Array2<Complex64>, rows: &Arc<dyn Fft<f64>>, cols: &Arc<dyn Fft<f64>>) {
        assert_eq!(data.dim(), (self.rows, self.cols), "FFT shape mismatch");

        // Rows are contiguous in standard layout, so one call transforms them all
        let mut owned = data.as_standard_layout().into_owned();
        if let Some(buf) = owned.as_slice_mut() {
            rows.process(buf);
        }

        let mut transposed = owned.t().as_standard_layout().into_owned();
        if let Some(buf) = transposed.as_slice_mut() {
            cols.process(buf);
        }
        data.assign(&transposed.t());
    }
}

/// Multiply two spectra elementwise and return the real part of the inverse transform
/// along with the largest absolute imaginary residual.
pub fn convolve_spectra(fft: &Fft2d, a: &Array2<Complex64>, b: &Array2<Complex64>) -> (Array2<f64>, f64) {
    let mut product = a * b;
    fft.inverse(&mut product);
    let max_imag = product.iter().fold(0.0_f64, |m, c| m.max(c.im.abs()));
    (product.mapv(|c| c.re), max_imag)
}

/// Smallest power of two that is >= `n`
pub fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}
