/// Image inputs behind a trait, so the patch ingester never touches file formats
///
/// [`crate::fits::FitsImage`] reads real exposures; [`InMemoryImage`] carries
/// synthetic arrays for tests and simulations.
use ndarray::Array2;
use std::collections::HashMap;
use tracing::warn;

use crate::error::{FitError, Result};
use crate::settings::ExtensionId;
use crate::wcs::{SkyTransform, TanWcs};

/// One exposure: named 2-D arrays, primary-header numbers and an astrometric transform
pub trait ImageSource {
    /// Name used in log lines and error messages
    fn label(&self) -> String;

    /// Pixel array of one extension, rows along NAXIS2
    fn array(&self, ext: &ExtensionId) -> Result<Array2<f64>>;

    /// Numeric primary-header keyword
    fn header_value(&self, key: &str) -> Option<f64>;

    /// Sky transform attached to the science extension
    fn sky_transform(&self, sci_ext: &ExtensionId) -> Result<Box<dyn SkyTransform>>;
}

/// Observation time: mid-exposure from EXPSTART/EXPEND, else BMJD_OBS, else 0
pub fn observation_mjd(source: &dyn ImageSource) -> f64 {
    match (source.header_value("EXPSTART"), source.header_value("EXPEND")) {
        (Some(start), Some(end)) => 0.5 * (start + end),
        _ => source.header_value("BMJD_OBS").unwrap_or_else(|| {
            warn!("{}: no EXPSTART/EXPEND/BMJD_OBS, using MJD 0", source.label());
            0.0
        }),
    }
}

/// Exposure held entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryImage {
    pub label: String,
    pub arrays: HashMap<String, Array2<f64>>,
    pub header: HashMap<String, f64>,
    pub wcs: TanWcs,
}

impl InMemoryImage {
    pub fn new(label: impl Into<String>, wcs: TanWcs) -> Self {
        Self {
            label: label.into(),
            arrays: HashMap::new(),
            header: HashMap::new(),
            wcs,
        }
    }

    pub fn with_array(mut self, ext: &ExtensionId, data: Array2<f64>) -> Self {
        self.arrays.insert(ext.to_string(), data);
        self
    }

    pub fn with_header(mut self, key: &str, value: f64) -> Self {
        self.header.insert(key.to_string(), value);
        self
    }
}

impl ImageSource for InMemoryImage {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn array(&self, ext: &ExtensionId) -> Result<Array2<f64>> {
        self.arrays.get(&ext.to_string()).cloned().ok_or_else(|| FitError::Ingest {
            image: self.label.clone(),
            message: format!("no extension {}", ext),
        })
    }

    fn header_value(&self, key: &str) -> Option<f64> {
        self.header.get(key).copied()
    }

    fn sky_transform(&self, _sci_ext: &ExtensionId) -> Result<Box<dyn SkyTransform>> {
        Ok(Box::new(self.wcs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> InMemoryImage {
        let wcs = TanWcs::new([1.0, 1.0], [10.0, 20.0], [[-1e-4, 0.0], [0.0, 1e-4]]).unwrap();
        InMemoryImage::new("synthetic", wcs)
    }

    #[test]
    fn test_mjd_prefers_exposure_midpoint() {
        let img = image()
            .with_header("EXPSTART", 60000.0)
            .with_header("EXPEND", 60000.5)
            .with_header("BMJD_OBS", 1.0);
        assert_eq!(observation_mjd(&img), 60000.25);
    }

    #[test]
    fn test_mjd_fallbacks() {
        assert_eq!(observation_mjd(&image().with_header("BMJD_OBS", 58000.0)), 58000.0);
        assert_eq!(observation_mjd(&image().with_header("EXPSTART", 1.0)), 0.0);
    }

    #[test]
    fn test_missing_extension() {
        let img = image().with_array(&ExtensionId::Name("SCI".into()), Array2::zeros((2, 2)));
        assert!(img.array(&ExtensionId::Name("SCI".into())).is_ok());
        assert!(img.array(&ExtensionId::Index(2)).is_err());
    }
}
