/// Gnomonic (TAN) world coordinate system with optional SIP distortion
///
/// Pixel coordinates follow the FITS convention: 1-based, `x` along columns
/// (NAXIS1) and `y` along rows (NAXIS2). Sky coordinates are in degrees.
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Bidirectional sky <-> pixel mapping of one image
pub trait SkyTransform: Send + Sync {
    /// Sky position to 1-based pixel `(x, y)`
    fn world_to_pixel(&self, ra: f64, dec: f64) -> (f64, f64);

    /// 1-based pixel `(x, y)` to sky position
    fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64);
}

/// Forward gnomonic projection, all angles in radians
#[inline]
fn tan_project(ra: f64, dec: f64, crval_ra: f64, crval_dec: f64) -> Option<(f64, f64)> {
    let da = ra - crval_ra;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

#[inline]
fn inverse_tan_project(xi: f64, eta: f64, crval_ra: f64, crval_dec: f64) -> (f64, f64) {
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let rho_sq = xi * xi + eta * eta;
    if rho_sq < 1e-30 {
        return (crval_ra, crval_dec);
    }
    let rho = rho_sq.sqrt();
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
    let ra = crval_ra + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

#[inline]
fn invert_2x2(m: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < 1e-30 {
        return None;
    }
    let inv = 1.0 / det;
    Some([[m[1][1] * inv, -m[0][1] * inv], [-m[1][0] * inv, m[0][0] * inv]])
}

/// Pixel-offset limit for the iterative SIP inverse
const SIP_INVERSE_TOLERANCE: f64 = 1e-10;
const SIP_INVERSE_MAX_ITERATIONS: usize = 100;

/// One `c * u^p * v^q` term of a SIP polynomial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SipTerm {
    pub p: i32,
    pub q: i32,
    pub coeff: f64,
}

/// Sparse SIP polynomial in pixel offsets from CRPIX
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipPolynomial {
    pub terms: Vec<SipTerm>,
}

impl SipPolynomial {
    /// Read `{prefix}_p_q` for every `p + q <= order`; absent keys are zero
    fn from_header(prefix: &str, order: i32, lookup: &impl Fn(&str) -> Option<f64>) -> Self {
        let mut terms = Vec::new();
        for p in 0..=order {
            for q in 0..=(order - p) {
                if let Some(coeff) = lookup(&format!("{}_{}_{}", prefix, p, q)).filter(|&c| c != 0.0) {
                    terms.push(SipTerm { p, q, coeff });
                }
            }
        }
        Self { terms }
    }

    pub fn eval(&self, u: f64, v: f64) -> f64 {
        self.terms.iter().map(|t| t.coeff * u.powi(t.p) * v.powi(t.q)).sum()
    }
}

/// Simple Imaging Polynomial distortion: forward `A`/`B`, optional inverse `AP`/`BP`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sip {
    pub a: SipPolynomial,
    pub b: SipPolynomial,
    pub ap: Option<SipPolynomial>,
    pub bp: Option<SipPolynomial>,
}

impl Sip {
    /// `None` unless both `A_ORDER` and `B_ORDER` are present
    pub fn from_header(lookup: &impl Fn(&str) -> Option<f64>) -> Option<Self> {
        let a_order = lookup("A_ORDER")?.round() as i32;
        let b_order = lookup("B_ORDER")?.round() as i32;
        let inverse = |key: &str, prefix: &str| {
            lookup(key).map(|order| SipPolynomial::from_header(prefix, order.round() as i32, lookup))
        };
        Some(Self {
            a: SipPolynomial::from_header("A", a_order, lookup),
            b: SipPolynomial::from_header("B", b_order, lookup),
            ap: inverse("AP_ORDER", "AP"),
            bp: inverse("BP_ORDER", "BP"),
        })
    }

    /// Undistorted offsets to distorted ones: `(u + A(u, v), v + B(u, v))`
    pub fn distort(&self, u: f64, v: f64) -> (f64, f64) {
        (u + self.a.eval(u, v), v + self.b.eval(u, v))
    }

    /// Invert [`distort`](Self::distort), seeded by `AP`/`BP` when present
    pub fn undistort(&self, u_target: f64, v_target: f64) -> (f64, f64) {
        let (mut u, mut v) = match (&self.ap, &self.bp) {
            (Some(ap), Some(bp)) => (
                u_target + ap.eval(u_target, v_target),
                v_target + bp.eval(u_target, v_target),
            ),
            _ => (u_target, v_target),
        };
        for _ in 0..SIP_INVERSE_MAX_ITERATIONS {
            let next_u = u_target - self.a.eval(u, v);
            let next_v = v_target - self.b.eval(u, v);
            let step = (next_u - u).abs().max((next_v - v).abs());
            u = next_u;
            v = next_v;
            if step < SIP_INVERSE_TOLERANCE {
                break;
            }
        }
        (u, v)
    }
}

/// TAN WCS, optionally with SIP distortion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanWcs {
    pub crpix: [f64; 2],
    /// Reference sky position in degrees
    pub crval: [f64; 2],
    /// Degrees per pixel
    pub cd: [[f64; 2]; 2],
    cd_inv: [[f64; 2]; 2],
    #[serde(default)]
    pub sip: Option<Sip>,
}

impl TanWcs {
    pub fn new(crpix: [f64; 2], crval: [f64; 2], cd: [[f64; 2]; 2]) -> Result<Self> {
        let cd_inv = invert_2x2(&cd).ok_or_else(|| FitError::InvalidSetting {
            key: "wcs",
            message: format!("singular CD matrix {:?}", cd),
        })?;
        Ok(Self {
            crpix,
            crval,
            cd,
            cd_inv,
            sip: None,
        })
    }

    pub fn with_sip(mut self, sip: Sip) -> Self {
        self.sip = Some(sip);
        self
    }

    /// Read CRPIX/CRVAL plus either CDi_j or CDELTi with an optional PCi_j rotation,
    /// and SIP terms when `A_ORDER`/`B_ORDER` are present
    pub fn from_header(lookup: impl Fn(&str) -> Option<f64>) -> Result<Self> {
        let need = |key: &'static str| {
            lookup(key).ok_or_else(|| FitError::InvalidSetting {
                key: "wcs",
                message: format!("header keyword {} missing", key),
            })
        };
        let crpix = [need("CRPIX1")?, need("CRPIX2")?];
        let crval = [need("CRVAL1")?, need("CRVAL2")?];

        let cd = match (lookup("CD1_1"), lookup("CD2_2")) {
            (Some(c11), Some(c22)) => [
                [c11, lookup("CD1_2").unwrap_or(0.0)],
                [lookup("CD2_1").unwrap_or(0.0), c22],
            ],
            _ => {
                let cdelt = [need("CDELT1")?, need("CDELT2")?];
                let pc = [
                    [lookup("PC1_1").unwrap_or(1.0), lookup("PC1_2").unwrap_or(0.0)],
                    [lookup("PC2_1").unwrap_or(0.0), lookup("PC2_2").unwrap_or(1.0)],
                ];
                [
                    [cdelt[0] * pc[0][0], cdelt[0] * pc[0][1]],
                    [cdelt[1] * pc[1][0], cdelt[1] * pc[1][1]],
                ]
            }
        };
        let wcs = Self::new(crpix, crval, cd)?;
        Ok(match Sip::from_header(&lookup) {
            Some(sip) => wcs.with_sip(sip),
            None => wcs,
        })
    }
}

impl SkyTransform for TanWcs {
    fn world_to_pixel(&self, ra: f64, dec: f64) -> (f64, f64) {
        let Some((xi, eta)) = tan_project(
            ra.to_radians(),
            dec.to_radians(),
            self.crval[0].to_radians(),
            self.crval[1].to_radians(),
        ) else {
            return (f64::NAN, f64::NAN);
        };
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let m = &self.cd_inv;
        let u = m[0][0] * xi + m[0][1] * eta;
        let v = m[1][0] * xi + m[1][1] * eta;
        let (u, v) = match &self.sip {
            Some(sip) => sip.undistort(u, v),
            None => (u, v),
        };
        (u + self.crpix[0], v + self.crpix[1])
    }

    fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let (dx, dy) = (x - self.crpix[0], y - self.crpix[1]);
        let (dx, dy) = match &self.sip {
            Some(sip) => sip.distort(dx, dy),
            None => (dx, dy),
        };
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();
        let (ra, dec) = inverse_tan_project(xi, eta, self.crval[0].to_radians(), self.crval[1].to_radians());
        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }
}
