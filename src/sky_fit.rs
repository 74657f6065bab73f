/// Low-order sky -> patch coordinate fits
///
/// Each axis of the patch is fit independently as a bilinear function of
/// centred, rescaled (RA, Dec): `c0 + c1*u + c2*v + c3*u*v`.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// One bilinear least-squares surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BilinearFit {
    ra_mean: f64,
    dec_mean: f64,
    ra_scale: f64,
    dec_scale: f64,
    coeffs: [f64; 4],
}

impl BilinearFit {
    pub fn fit(ra: &[f64], dec: &[f64], target: &[f64]) -> Result<Self> {
        let n = target.len();
        if ra.len() != n || dec.len() != n || n < 4 {
            return Err(FitError::Solver(format!(
                "bilinear fit needs >= 4 matched samples, got {} / {} / {}",
                ra.len(),
                dec.len(),
                n
            )));
        }

        let ra_mean = ra.iter().sum::<f64>() / n as f64;
        let dec_mean = dec.iter().sum::<f64>() / n as f64;
        let spread = |v: &[f64], m: f64| {
            let s = v.iter().fold(0.0_f64, |acc, x| acc.max((x - m).abs()));
            if s > 0.0 {
                s
            } else {
                1.0
            }
        };
        let ra_scale = spread(ra, ra_mean);
        let dec_scale = spread(dec, dec_mean);

        let design = DMatrix::from_fn(n, 4, |row, col| {
            let u = (ra[row] - ra_mean) / ra_scale;
            let v = (dec[row] - dec_mean) / dec_scale;
            match col {
                0 => 1.0,
                1 => u,
                2 => v,
                _ => u * v,
            }
        });
        let b = DVector::from_column_slice(target);
        let solution = design
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| FitError::Solver(format!("bilinear fit: {}", e)))?;

        Ok(Self {
            ra_mean,
            dec_mean,
            ra_scale,
            dec_scale,
            coeffs: [solution[0], solution[1], solution[2], solution[3]],
        })
    }

    #[inline]
    pub fn eval(&self, ra: f64, dec: f64) -> f64 {
        let u = (ra - self.ra_mean) / self.ra_scale;
        let v = (dec - self.dec_mean) / self.dec_scale;
        let c = &self.coeffs;
        c[0] + c[1] * u + c[2] * v + c[3] * u * v
    }
}

/// Sky position to fractional patch `(row, col)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyToPatch {
    pub row: BilinearFit,
    pub col: BilinearFit,
}

impl SkyToPatch {
    pub fn fit(ra: &[f64], dec: &[f64], rows: &[f64], cols: &[f64]) -> Result<Self> {
        Ok(Self {
            row: BilinearFit::fit(ra, dec, rows)?,
            col: BilinearFit::fit(ra, dec, cols)?,
        })
    }

    pub fn locate(&self, ra: f64, dec: f64) -> (f64, f64) {
        (self.row.eval(ra, dec), self.col.eval(ra, dec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_recovers_bilinear_surface() {
        let mut ra = Vec::new();
        let mut dec = Vec::new();
        let mut z = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                let r = 10.0 + i as f64 * 1e-5;
                let d = -5.0 + j as f64 * 1e-5;
                ra.push(r);
                dec.push(d);
                z.push(3.0 + 2e5 * (r - 10.0) - 1e5 * (d + 5.0) + 1e9 * (r - 10.0) * (d + 5.0));
            }
        }
        let fit = BilinearFit::fit(&ra, &dec, &z).unwrap();
        for k in [0, 9, 30, 63] {
            assert_abs_diff_eq!(fit.eval(ra[k], dec[k]), z[k], epsilon = 1e-8);
        }
        assert_abs_diff_eq!(fit.eval(10.000_035, -4.999_965), 3.0 + 7.0 - 3.5 + 1.225, epsilon = 1e-8);
    }

    #[test]
    fn test_too_few_samples() {
        assert!(BilinearFit::fit(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 2.0]).is_err());
    }
}
