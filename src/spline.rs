//! Order-2 (quadratic) B-spline interpolation of 2-D rasters.
//!
//! The raster is first prefiltered into interpolating B-spline coefficients
//! (mirror-symmetric boundaries), then sampled at arbitrary fractional
//! `(row, col)` coordinates. Coordinates outside `[0, n - 1]` on either axis
//! return zero.

use ndarray::{Array2, Axis};

/// Pole of the quadratic B-spline prefilter, `sqrt(8) - 3`
const POLE: f64 = -0.171_572_875_253_809_9;
const BOUNDARY_TOLERANCE: f64 = 1e-15;
const EDGE_EPSILON: f64 = 1e-9;

/// Prefiltered quadratic spline surface
#[derive(Debug, Clone)]
pub struct QuadraticSpline {
    coeffs: Array2<f64>,
}

impl QuadraticSpline {
    /// Prefilter `samples` so that the spline interpolates them exactly
    pub fn new(samples: &Array2<f64>) -> Self {
        let mut coeffs = samples.to_owned();
        for axis in [Axis(0), Axis(1)] {
            for mut lane in coeffs.lanes_mut(axis) {
                let mut line: Vec<f64> = lane.iter().copied().collect();
                filter_line(&mut line);
                for (dst, src) in lane.iter_mut().zip(line) {
                    *dst = src;
                }
            }
        }
        Self { coeffs }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.coeffs.dim()
    }

    /// Sample at fractional `(row, col)`; zero outside the raster
    pub fn sample(&self, row: f64, col: f64) -> f64 {
        let (nr, nc) = self.coeffs.dim();
        if !in_range(row, nr) || !in_range(col, nc) {
            return 0.0;
        }
        let (r0, wr) = weights(row);
        let (c0, wc) = weights(col);

        let mut total = 0.0;
        for (di, w_i) in wr.iter().enumerate() {
            let ri = mirror(r0 + di as isize, nr);
            let mut acc = 0.0;
            for (dj, w_j) in wc.iter().enumerate() {
                acc += w_j * self.coeffs[[ri, mirror(c0 + dj as isize, nc)]];
            }
            total += w_i * acc;
        }
        total
    }
}

#[inline]
fn in_range(x: f64, n: usize) -> bool {
    x.is_finite() && x >= -EDGE_EPSILON && x <= (n as f64 - 1.0) + EDGE_EPSILON
}

/// First contributing index and the three quadratic B-spline weights
#[inline]
fn weights(x: f64) -> (isize, [f64; 3]) {
    let centre = (x + 0.5).floor();
    let t = x - centre;
    let w = [
        0.5 * (0.5 - t) * (0.5 - t),
        0.75 - t * t,
        0.5 * (0.5 + t) * (0.5 + t),
    ];
    (centre as isize - 1, w)
}

/// Mirror-reflect an index about the end samples
#[inline]
fn mirror(mut idx: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let last = n as isize - 1;
    loop {
        if idx < 0 {
            idx = -idx;
        } else if idx > last {
            idx = 2 * last - idx;
        } else {
            return idx as usize;
        }
    }
}

/// In-place recursive prefilter of one line
fn filter_line(c: &mut [f64]) {
    let n = c.len();
    if n < 2 {
        return;
    }
    let z = POLE;
    let gain = (1.0 - z) * (1.0 - 1.0 / z);
    c.iter_mut().for_each(|v| *v *= gain);

    c[0] = causal_init(c, z);
    for k in 1..n {
        c[k] += z * c[k - 1];
    }
    c[n - 1] = (z / (z * z - 1.0)) * (z * c[n - 2] + c[n - 1]);
    for k in (0..n - 1).rev() {
        c[k] = z * (c[k + 1] - c[k]);
    }
}

fn causal_init(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    let horizon = (BOUNDARY_TOLERANCE.ln() / z.abs().ln()).ceil() as usize;
    if horizon < n {
        let mut zn = 1.0;
        let mut sum = 0.0;
        for &v in &c[..horizon] {
            sum += zn * v;
            zn *= z;
        }
        return sum;
    }

    // Exact mirror-symmetric initialisation for short lines
    let iz = 1.0 / z;
    let mut zn = z;
    let mut z2n = z.powi(n as i32 - 1);
    let mut sum = c[0] + z2n * c[n - 1];
    z2n *= z2n * iz;
    for &v in &c[1..n - 1] {
        sum += (zn + z2n) * v;
        zn *= z;
        z2n *= iz;
    }
    sum / (1.0 - zn * zn)
}
