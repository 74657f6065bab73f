/// Parameter codec: flat solver vector <-> structured parameter record
///
/// The flat layout is fixed and described by [`ParameterLayout`]:
/// `[coefficients, dRA x n_img, dDec x n_img, sn dRA, sn dDec, flux x n_epoch]`.
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{FitError, Result};
use crate::settings::Settings;

/// Whether mesh cell (i, j) lies inside the circle of the given radius
#[inline]
pub fn is_active_cell(i: usize, j: usize, radius: usize) -> bool {
    let di = i as f64 - radius as f64;
    let dj = j as f64 - radius as f64;
    let r = radius as f64;
    di * di + dj * dj < r * r
}

/// Number of active cells in the (2r+1) x (2r+1) mesh
pub fn active_cell_count(radius: usize) -> usize {
    let side = 2 * radius + 1;
    (0..side)
        .flat_map(|i| (0..side).map(move |j| (i, j)))
        .filter(|&(i, j)| is_active_cell(i, j, radius))
        .count()
}

/// Scatter active-cell values (raster order) into a square mesh. Inactive cells are 0.
pub fn reshape_coeffs(coeffs: &[f64], radius: usize) -> Result<Array2<f64>> {
    let expected = active_cell_count(radius);
    if coeffs.len() != expected {
        return Err(FitError::ParameterLength {
            expected,
            got: coeffs.len(),
        });
    }
    let side = 2 * radius + 1;
    let mut mesh = Array2::<f64>::zeros((side, side));
    let mut values = coeffs.iter();
    for i in 0..side {
        for j in 0..side {
            if is_active_cell(i, j, radius) {
                if let Some(&v) = values.next() {
                    mesh[[i, j]] = v;
                }
            }
        }
    }
    Ok(mesh)
}

/// Gather the active cells of a square mesh in raster order
pub fn unreshape_coeffs(mesh: &Array2<f64>, radius: usize) -> Vec<f64> {
    let side = 2 * radius + 1;
    let mut out = Vec::with_capacity(active_cell_count(radius));
    for i in 0..side {
        for j in 0..side {
            if is_active_cell(i, j, radius) {
                out.push(mesh[[i, j]]);
            }
        }
    }
    out
}

/// Named segment of the flat parameter vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    Coefficients,
    ImageDeltaRa,
    ImageDeltaDec,
    TransientDeltaRa,
    TransientDeltaDec,
    Flux,
}

impl Segment {
    pub const ORDER: [Segment; 6] = [
        Segment::Coefficients,
        Segment::ImageDeltaRa,
        Segment::ImageDeltaDec,
        Segment::TransientDeltaRa,
        Segment::TransientDeltaDec,
        Segment::Flux,
    ];
}

/// Ordered schema of the flat parameter vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterLayout {
    pub radius: usize,
    pub n_coeff: usize,
    pub n_img: usize,
    pub n_epoch: usize,
}

impl ParameterLayout {
    pub fn new(radius: usize, n_img: usize, n_epoch: usize) -> Self {
        Self {
            radius,
            n_coeff: active_cell_count(radius),
            n_img,
            n_epoch,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.spline_radius, settings.n_img(), settings.n_epoch)
    }

    pub fn segment_len(&self, segment: Segment) -> usize {
        match segment {
            Segment::Coefficients => self.n_coeff,
            Segment::ImageDeltaRa | Segment::ImageDeltaDec => self.n_img,
            Segment::TransientDeltaRa | Segment::TransientDeltaDec => 1,
            Segment::Flux => self.n_epoch,
        }
    }

    /// Index range of a segment in the flat vector
    pub fn range(&self, segment: Segment) -> Range<usize> {
        let start: usize = Segment::ORDER
            .iter()
            .take_while(|&&s| s != segment)
            .map(|&s| self.segment_len(s))
            .sum();
        start..start + self.segment_len(segment)
    }

    pub fn len(&self) -> usize {
        Segment::ORDER.iter().map(|&s| self.segment_len(s)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a step-scale vector by assigning one value per segment
    pub fn scale_vector(&self, scale: impl Fn(Segment) -> f64) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.len());
        for s in Segment::ORDER {
            out.extend(std::iter::repeat(scale(s)).take(self.segment_len(s)));
        }
        out
    }

    /// Flatten a record into a parameter vector
    pub fn unparse(&self, record: &ParameterRecord) -> Vec<f64> {
        let mut p = Vec::with_capacity(self.len());
        p.extend(unreshape_coeffs(&record.coeffs, self.radius));
        p.extend_from_slice(&record.d_ra);
        p.extend_from_slice(&record.d_dec);
        p.push(record.sn_d_ra);
        p.push(record.sn_d_dec);
        p.extend_from_slice(&record.flux);
        p
    }

    /// Rebuild a record from a parameter vector; exact inverse of [`unparse`](Self::unparse)
    pub fn parse(&self, p: &[f64]) -> Result<ParameterRecord> {
        if p.len() != self.len() {
            return Err(FitError::ParameterLength {
                expected: self.len(),
                got: p.len(),
            });
        }
        Ok(ParameterRecord {
            coeffs: reshape_coeffs(&p[self.range(Segment::Coefficients)], self.radius)?,
            d_ra: p[self.range(Segment::ImageDeltaRa)].to_vec(),
            d_dec: p[self.range(Segment::ImageDeltaDec)].to_vec(),
            sn_d_ra: p[self.range(Segment::TransientDeltaRa).start],
            sn_d_dec: p[self.range(Segment::TransientDeltaDec).start],
            flux: p[self.range(Segment::Flux)].to_vec(),
        })
    }
}

/// Structured fit parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    /// Galaxy coefficient mesh; zero outside the active circle
    pub coeffs: Array2<f64>,
    /// Per-image RA offsets in degrees
    pub d_ra: Vec<f64>,
    /// Per-image Dec offsets in degrees
    pub d_dec: Vec<f64>,
    /// Transient RA offset shared by all images, degrees
    pub sn_d_ra: f64,
    /// Transient Dec offset shared by all images, degrees
    pub sn_d_dec: f64,
    /// Transient flux per non-reference epoch (epoch `k` at index `k - 1`)
    pub flux: Vec<f64>,
}

impl ParameterRecord {
    /// Starting point of a fit: flat galaxy and fluxes at `flux_scale`, no offsets
    pub fn initial(settings: &Settings, flux_scale: f64) -> Self {
        let layout = ParameterLayout::from_settings(settings);
        let side = 2 * layout.radius + 1;
        Self {
            coeffs: Array2::from_shape_fn((side, side), |(i, j)| {
                if is_active_cell(i, j, layout.radius) {
                    flux_scale
                } else {
                    0.0
                }
            }),
            d_ra: vec![0.0; layout.n_img],
            d_dec: vec![0.0; layout.n_img],
            sn_d_ra: settings.sn_ra_offset,
            sn_d_dec: settings.sn_dec_offset,
            flux: vec![flux_scale; layout.n_epoch],
        }
    }

    /// Point-source RA of image `i`: reference + image offset + transient offset
    pub fn point_ra(&self, ra0: f64, i: usize) -> f64 {
        ra0 + self.d_ra[i] + self.sn_d_ra
    }

    /// Point-source Dec of image `i`: reference + image offset + transient offset
    pub fn point_dec(&self, dec0: f64, i: usize) -> f64 {
        dec0 + self.d_dec[i] + self.sn_d_dec
    }

    /// Flux of the given epoch number, `None` for the reference epoch
    pub fn epoch_flux(&self, epoch: usize) -> Option<f64> {
        epoch.checked_sub(1).and_then(|k| self.flux.get(k).copied())
    }
}

/// Record plus derived point-source sky positions, keyed the way downstream
/// photometry tools read the `PARSED_JSON_BELOW` block of the text report
#[derive(Debug, Clone, Serialize)]
pub struct ParsedParameters {
    /// Mesh rows
    pub coeffs: Vec<Vec<f64>>,
    #[serde(rename = "dRA")]
    pub d_ra: Vec<f64>,
    #[serde(rename = "dDec")]
    pub d_dec: Vec<f64>,
    #[serde(rename = "sndRA_offset")]
    pub sn_d_ra: f64,
    #[serde(rename = "sndDec_offset")]
    pub sn_d_dec: f64,
    #[serde(rename = "SN_ampl")]
    pub flux: Vec<f64>,
    #[serde(rename = "pt_RA")]
    pub pt_ra: Vec<f64>,
    #[serde(rename = "pt_Dec")]
    pub pt_dec: Vec<f64>,
}

impl ParsedParameters {
    pub fn new(record: &ParameterRecord, settings: &Settings) -> Self {
        let (pt_ra, pt_dec) = settings
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| (record.point_ra(img.ra0, i), record.point_dec(img.dec0, i)))
            .unzip();
        Self {
            coeffs: record.coeffs.outer_iter().map(|row| row.to_vec()).collect(),
            d_ra: record.d_ra.clone(),
            d_dec: record.d_dec.clone(),
            sn_d_ra: record.sn_d_ra,
            sn_d_dec: record.sn_d_dec,
            flux: record.flux.clone(),
            pt_ra,
            pt_dec,
        }
    }
}
