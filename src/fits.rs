/// FITS adapter built on `fitrs`
///
/// Reads science/error/DQ extensions, primary-header numbers and the TAN WCS of
/// an exposure, single-HDU rasters (PSFs, pixel-area maps), and writes image
/// cubes with one plane per input image.
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue, Hdu};
use ndarray::{Array2, Array3};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{FitError, Result};
use crate::image_source::ImageSource;
use crate::settings::ExtensionId;
use crate::wcs::{SkyTransform, TanWcs};

/// Upper bound on HDUs scanned when looking an extension up by name
const MAX_HDUS: usize = 1024;

fn header_float(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) => Some(*n as f64),
        Some(HeaderValue::RealFloatingNumber(f)) => Some(*f),
        _ => None,
    }
}

fn header_string(hdu: &Hdu, key: &str) -> Option<String> {
    match hdu.value(key) {
        Some(HeaderValue::CharacterString(s)) => Some(s.trim().to_string()),
        _ => None,
    }
}

fn header_dim(hdu: &Hdu, key: &str, path: &Path) -> Result<usize> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) if *n >= 0 => Ok(*n as usize),
        Some(_) => Err(FitError::fits(path, format!("{} is not a non-negative integer", key))),
        None => Err(FitError::fits(path, format!("missing {} header", key))),
    }
}

/// Decode the data unit of a 2-D HDU into `(NAXIS2, NAXIS1)` floats. Blank integers become NaN.
/// Stored values are mapped to physical ones as `BZERO + BSCALE * stored`.
fn hdu_array(hdu: &Hdu, path: &Path) -> Result<Array2<f64>> {
    let width = header_dim(hdu, "NAXIS1", path)?;
    let height = header_dim(hdu, "NAXIS2", path)?;
    let bscale = header_float(hdu, "BSCALE").unwrap_or(1.0);
    let bzero = header_float(hdu, "BZERO").unwrap_or(0.0);

    let mut values: Vec<f64> = match hdu.read_data() {
        FitsData::Characters(_) => {
            return Err(FitError::fits(path, "HDU contains character data, not an image"));
        }
        FitsData::IntegersI32(FitsDataArray { data, .. }) => {
            data.iter().map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN)).collect()
        }
        FitsData::IntegersU32(FitsDataArray { data, .. }) => {
            data.iter().map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN)).collect()
        }
        FitsData::FloatingPoint32(FitsDataArray { data, .. }) => data.iter().map(|&x| x as f64).collect(),
        FitsData::FloatingPoint64(FitsDataArray { data, .. }) => data.iter().copied().collect(),
    };

    if values.len() != width * height {
        return Err(FitError::fits(
            path,
            format!("data size mismatch: expected {} pixels, got {}", width * height, values.len()),
        ));
    }
    if bscale != 1.0 || bzero != 0.0 {
        debug!("Scaling {} with BSCALE {} BZERO {}", path.display(), bscale, bzero);
        values.iter_mut().for_each(|v| *v = bzero + bscale * *v);
    }
    Array2::from_shape_vec((height, width), values).map_err(|e| FitError::fits(path, e.to_string()))
}

fn open(path: &Path) -> Result<Fits> {
    Fits::open(path).map_err(|e| FitError::io(path, e))
}

/// Locate an HDU by index, `EXTNAME`, or `(EXTNAME, EXTVER)`
fn find_hdu(fits: &Fits, ext: &ExtensionId, path: &Path) -> Result<Hdu> {
    let matches_name = |hdu: &Hdu, name: &str, version: Option<i64>| {
        let name_ok = header_string(hdu, "EXTNAME").is_some_and(|n| n.eq_ignore_ascii_case(name));
        let version_ok = match version {
            Some(v) => header_float(hdu, "EXTVER").unwrap_or(1.0) as i64 == v,
            None => true,
        };
        name_ok && version_ok
    };

    let found = match ext {
        ExtensionId::Index(i) => fits.get(*i),
        ExtensionId::Name(name) => (0..MAX_HDUS)
            .map_while(|i| fits.get(i))
            .find(|hdu| matches_name(hdu, name, None)),
        ExtensionId::NameVersion(name, version) => (0..MAX_HDUS)
            .map_while(|i| fits.get(i))
            .find(|hdu| matches_name(hdu, name, Some(*version))),
    };
    found.ok_or_else(|| FitError::fits(path, format!("no extension {}", ext)))
}

/// Read one extension of a file as a 2-D array
pub fn read_extension(path: &Path, ext: &ExtensionId) -> Result<Array2<f64>> {
    let fits = open(path)?;
    let hdu = find_hdu(&fits, ext, path)?;
    let data = hdu_array(&hdu, path)?;
    debug!("Read {} [{}]: {:?}", path.display(), ext, data.dim());
    Ok(data)
}

/// Read the primary HDU, e.g. a PSF raster
pub fn read_primary(path: &Path) -> Result<Array2<f64>> {
    read_extension(path, &ExtensionId::Index(0))
}

/// Multi-extension exposure on disk
pub struct FitsImage {
    path: PathBuf,
    fits: Fits,
}

impl FitsImage {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            fits: open(path)?,
        })
    }
}

impl ImageSource for FitsImage {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn array(&self, ext: &ExtensionId) -> Result<Array2<f64>> {
        let hdu = find_hdu(&self.fits, ext, &self.path)?;
        hdu_array(&hdu, &self.path)
    }

    fn header_value(&self, key: &str) -> Option<f64> {
        self.fits.get(0).and_then(|hdu| header_float(&hdu, key))
    }

    fn sky_transform(&self, sci_ext: &ExtensionId) -> Result<Box<dyn SkyTransform>> {
        let hdu = find_hdu(&self.fits, sci_ext, &self.path)?;
        let wcs = TanWcs::from_header(|key| header_float(&hdu, key)).map_err(|e| FitError::Ingest {
            image: self.label(),
            message: e.to_string(),
        })?;
        Ok(Box::new(wcs))
    }
}

/// Write a 2-D image as a single primary HDU
pub fn write_image(path: &Path, image: &Array2<f64>) -> Result<()> {
    let (rows, cols) = image.dim();
    let data: Vec<f64> = image.iter().copied().collect();
    create(path, Hdu::new(&[cols, rows], data))
}

/// Write a stack of equally-sized planes as one 3-D primary HDU, plane index along NAXIS3
pub fn write_cube(path: &Path, cube: &Array3<f64>) -> Result<()> {
    let (planes, rows, cols) = cube.dim();
    let data: Vec<f64> = cube.iter().copied().collect();
    create(path, Hdu::new(&[cols, rows, planes], data))
}

/// Stack 2-D planes and write them as a cube
pub fn write_planes(path: &Path, planes: &[Array2<f64>]) -> Result<()> {
    let (rows, cols) = planes.first().map(|p| p.dim()).unwrap_or((0, 0));
    let mut cube = Array3::zeros((planes.len(), rows, cols));
    for (mut dst, src) in cube.outer_iter_mut().zip(planes) {
        dst.assign(src);
    }
    write_cube(path, &cube)
}

fn create(path: &Path, hdu: Hdu) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| FitError::io(path, e))?;
    }
    Fits::create(path, hdu).map_err(|e| FitError::io(path, e))?;
    debug!("Wrote {}", path.display());
    Ok(())
}
