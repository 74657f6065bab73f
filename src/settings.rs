/// Fit settings: parameter-file parsing, validation and derived quantities
///
/// The parameter file is line oriented. Each line is `key value`, where `#` starts a
/// comment and the value is a literal (number, quoted string, `True`/`False`/`None`,
/// list or tuple, with `+ - * /` allowed between numbers, e.g. `0.1/3600.`).
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::{FitError, Result};
use crate::params::active_cell_count;

/// Identifier of a FITS extension: an HDU index, an `EXTNAME`, or `(EXTNAME, EXTVER)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionId {
    Index(usize),
    Name(String),
    NameVersion(String, i64),
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionId::Index(i) => write!(f, "{}", i),
            ExtensionId::Name(n) => write!(f, "{}", n),
            ExtensionId::NameVersion(n, v) => write!(f, "{},{}", n, v),
        }
    }
}

/// Epoch label as written in the parameter file. The integer label 0 is the
/// reference epoch (no transient flux).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EpochLabel {
    Number(i64),
    Text(String),
}

impl EpochLabel {
    pub fn reference() -> Self {
        EpochLabel::Number(0)
    }
}

impl fmt::Display for EpochLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochLabel::Number(n) => write!(f, "{}", n),
            EpochLabel::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Int(i64),
}

impl From<FlagValue> for bool {
    fn from(v: FlagValue) -> Self {
        match v {
            FlagValue::Bool(b) => b,
            FlagValue::Int(i) => i != 0,
        }
    }
}

/// A present key is always `Some`, even when its value is `None`. Only an absent
/// key takes the `None` default.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Settings exactly as read from the parameter file, before validation
#[derive(Debug, Clone, Default, Deserialize)]
struct RawSettings {
    patch: Option<i64>,
    oversample: Option<i64>,
    splineradius: Option<i64>,
    splinepixelscale: Option<f64>,
    images: Option<Vec<String>>,
    sciext: Option<OneOrMany<ExtensionId>>,
    errext: Option<OneOrMany<ExtensionId>>,
    dqext: Option<OneOrMany<ExtensionId>>,
    errscale: Option<OneOrMany<f64>>,
    #[serde(default, deserialize_with = "present")]
    pixel_area_map: Option<OneOrMany<Option<String>>>,
    #[serde(default, deserialize_with = "present")]
    bad_pixel_list: Option<OneOrMany<Option<String>>>,
    #[serde(rename = "RA0")]
    ra0: Option<OneOrMany<f64>>,
    #[serde(rename = "Dec0")]
    dec0: Option<OneOrMany<f64>>,
    psfs: Option<OneOrMany<String>>,
    epochs: Option<Vec<EpochLabel>>,
    okaydqs: Option<Vec<i64>>,
    psf_has_pix: Option<FlagValue>,
    renormpsf: Option<FlagValue>,
    apodize: Option<FlagValue>,
    #[serde(rename = "fitSNoffset")]
    fit_sn_offset: Option<FlagValue>,
    iterative_centroid: Option<FlagValue>,
    #[serde(rename = "sndRA_offset")]
    sn_ra_offset: Option<f64>,
    #[serde(rename = "sndDec_offset")]
    sn_dec_offset: Option<f64>,
    n_iter: Option<i64>,
    #[serde(rename = "SN_centroid_prior_arcsec")]
    centroid_prior_arcsec: Option<f64>,
    n_cpu: Option<i64>,
    base_dir: Option<String>,
}

/// Per-image inputs, one entry per image in parameter-file order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSettings {
    pub path: PathBuf,
    pub sci_ext: ExtensionId,
    pub err_ext: ExtensionId,
    pub dq_ext: ExtensionId,
    pub err_scale: f64,
    pub pixel_area_map: Option<PathBuf>,
    pub bad_pixel_list: Option<PathBuf>,
    /// Astrometric reference RA in degrees
    pub ra0: f64,
    /// Astrometric reference Dec in degrees
    pub dec0: f64,
    pub psf: PathBuf,
    /// Epoch number; 0 is the reference epoch
    pub epoch: usize,
}

/// Validated fit settings. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Patch side length in detector pixels (odd)
    pub patch: usize,
    pub oversample: usize,
    pub spline_radius: usize,
    /// Mesh cell size in degrees
    pub spline_pixel_scale: f64,
    pub images: Vec<ImageSettings>,
    /// Epoch labels indexed by epoch number; entry 0 is the reference epoch
    pub epoch_names: Vec<EpochLabel>,
    pub n_epoch: usize,
    pub n_coeff: usize,
    pub okay_dqs: Vec<i64>,
    pub psf_has_pix: bool,
    pub apodize: bool,
    pub fit_sn_offset: bool,
    pub iterative_centroid: bool,
    pub sn_ra_offset: f64,
    pub sn_dec_offset: f64,
    pub n_iter: usize,
    pub centroid_prior_arcsec: f64,
    pub n_cpu: usize,
    pub base_dir: PathBuf,
}

impl Settings {
    /// Read and validate a parameter file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| FitError::io(path, e))?;
        let map = parse_param_text(&text, path)?;
        info!("Read {} settings from {}", map.len(), path.display());
        Self::from_map(map)
    }

    /// Validate a parsed key/value map
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let raw: RawSettings = serde_json::from_value(Value::Object(map))?;
        Self::finish(raw)
    }

    fn finish(raw: RawSettings) -> Result<Self> {
        let patch = positive("patch", require("patch", raw.patch)?)?;
        if patch % 2 != 1 {
            return Err(FitError::InvalidSetting {
                key: "patch",
                message: format!("patch must be odd, got {}", patch),
            });
        }
        let oversample = positive("oversample", require("oversample", raw.oversample)?)?;
        let spline_radius = positive("splineradius", require("splineradius", raw.splineradius)?)?;
        let spline_pixel_scale =
            positive_f64("splinepixelscale", require("splinepixelscale", raw.splinepixelscale)?)?;

        let image_paths = require("images", raw.images)?;
        let n_img = image_paths.len();
        if n_img == 0 {
            return Err(FitError::InvalidSetting {
                key: "images",
                message: "no images given".to_string(),
            });
        }
        for img in &image_paths {
            if img.contains("_pam_") || img.contains("_pam.") {
                return Err(FitError::InvalidSetting {
                    key: "images",
                    message: format!("{} looks like a pixel area map", img),
                });
            }
        }

        let fit_sn_offset: bool = require("fitSNoffset", raw.fit_sn_offset)?.into();
        let iterative_centroid: bool = raw.iterative_centroid.map(bool::from).unwrap_or(false);
        if iterative_centroid && fit_sn_offset {
            return Err(FitError::InvalidSetting {
                key: "iterative_centroid",
                message: "can't iterate a SN centroid; fitSNoffset requires all images to be fit jointly"
                    .to_string(),
            });
        }
        if raw.renormpsf.map(bool::from).unwrap_or(false) {
            return Err(FitError::InvalidSetting {
                key: "renormpsf",
                message: "PSF renormalisation is not supported".to_string(),
            });
        }

        let sci_ext = per_image("sciext", require("sciext", raw.sciext)?, n_img)?;
        let err_ext = per_image("errext", require("errext", raw.errext)?, n_img)?;
        let dq_ext = per_image("dqext", require("dqext", raw.dqext)?, n_img)?;
        let err_scale = per_image("errscale", require("errscale", raw.errscale)?, n_img)?;
        let pams = per_image(
            "pixel_area_map",
            require("pixel_area_map", raw.pixel_area_map)?,
            n_img,
        )?;
        let bad_lists = per_image(
            "bad_pixel_list",
            require("bad_pixel_list", raw.bad_pixel_list)?,
            n_img,
        )?;
        let ra0 = per_image("RA0", require("RA0", raw.ra0)?, n_img)?;
        let dec0 = per_image("Dec0", require("Dec0", raw.dec0)?, n_img)?;
        let psfs = per_image("psfs", require("psfs", raw.psfs)?, n_img)?;

        let epoch_labels = require("epochs", raw.epochs)?;
        check_len("epochs", epoch_labels.len(), n_img)?;
        let (epoch_names, epoch_numbers) = number_epochs(&epoch_labels);
        let n_epoch = epoch_numbers.iter().copied().max().unwrap_or(0);

        let images = (0..n_img)
            .map(|i| ImageSettings {
                path: PathBuf::from(&image_paths[i]),
                sci_ext: sci_ext[i].clone(),
                err_ext: err_ext[i].clone(),
                dq_ext: dq_ext[i].clone(),
                err_scale: err_scale[i],
                pixel_area_map: non_empty_path(&pams[i]),
                bad_pixel_list: non_empty_path(&bad_lists[i]),
                ra0: ra0[i],
                dec0: dec0[i],
                psf: PathBuf::from(&psfs[i]),
                epoch: epoch_numbers[i],
            })
            .collect();

        let n_cpu = match raw.n_cpu {
            Some(n) => positive("n_cpu", n)?,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let settings = Settings {
            patch,
            oversample,
            spline_radius,
            spline_pixel_scale,
            images,
            epoch_names,
            n_epoch,
            n_coeff: active_cell_count(spline_radius),
            okay_dqs: require("okaydqs", raw.okaydqs)?,
            psf_has_pix: require("psf_has_pix", raw.psf_has_pix)?.into(),
            apodize: require("apodize", raw.apodize)?.into(),
            fit_sn_offset,
            iterative_centroid,
            sn_ra_offset: require("sndRA_offset", raw.sn_ra_offset)?,
            sn_dec_offset: require("sndDec_offset", raw.sn_dec_offset)?,
            n_iter: require("n_iter", raw.n_iter)?.max(0) as usize,
            centroid_prior_arcsec: positive_f64(
                "SN_centroid_prior_arcsec",
                require("SN_centroid_prior_arcsec", raw.centroid_prior_arcsec)?,
            )?,
            n_cpu,
            base_dir: PathBuf::from(require("base_dir", raw.base_dir)?),
        };

        debug!(
            "n_img {} n_epoch {} n_coeff {} oversample {}",
            settings.n_img(),
            settings.n_epoch,
            settings.n_coeff,
            settings.oversample
        );
        Ok(settings)
    }

    pub fn n_img(&self) -> usize {
        self.images.len()
    }

    /// Half patch size, `floor(patch / 2)`
    pub fn patch2(&self) -> usize {
        self.patch / 2
    }

    /// Oversampled-grid offset of the first detector-pixel centre, `floor(oversample / 2)`
    pub fn oversample2(&self) -> usize {
        self.oversample / 2
    }

    /// Image indices belonging to epoch number `epoch`
    pub fn images_in_epoch(&self, epoch: usize) -> Vec<usize> {
        self.images
            .iter()
            .enumerate()
            .filter(|(_, img)| img.epoch == epoch)
            .map(|(i, _)| i)
            .collect()
    }
}

fn require<T>(key: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or(FitError::MissingSetting(key))
}

fn positive(key: &'static str, value: i64) -> Result<usize> {
    if value <= 0 {
        return Err(FitError::InvalidSetting {
            key,
            message: format!("must be positive, got {}", value),
        });
    }
    Ok(value as usize)
}

fn positive_f64(key: &'static str, value: f64) -> Result<f64> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(FitError::InvalidSetting {
            key,
            message: format!("must be a positive number, got {}", value),
        });
    }
    Ok(value)
}

fn check_len(key: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(FitError::ListLength { key, expected, got });
    }
    Ok(())
}

/// Broadcast a scalar to every image, or check a list has one entry per image.
/// A single-element list is broadcast too.
fn per_image<T: Clone>(key: &'static str, value: OneOrMany<T>, n_img: usize) -> Result<Vec<T>> {
    match value {
        OneOrMany::One(v) => Ok(vec![v; n_img]),
        OneOrMany::Many(list) if list.len() == 1 && n_img > 1 => Ok(vec![list[0].clone(); n_img]),
        OneOrMany::Many(list) => {
            check_len(key, list.len(), n_img)?;
            Ok(list)
        }
    }
}

fn non_empty_path(value: &Option<String>) -> Option<PathBuf> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Assign epoch numbers in first-seen order. Label 0 is always epoch 0.
fn number_epochs(labels: &[EpochLabel]) -> (Vec<EpochLabel>, Vec<usize>) {
    let mut names = vec![EpochLabel::reference()];
    let mut numbers = Vec::with_capacity(labels.len());
    for label in labels {
        let idx = match names.iter().position(|n| n == label) {
            Some(idx) => idx,
            None => {
                names.push(label.clone());
                names.len() - 1
            }
        };
        numbers.push(idx);
    }
    (names, numbers)
}

fn line_regex() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^\s*(\S+)\s+(.*\S)\s*$").expect("static regex"))
}

/// Parse parameter-file text into a key/value map. Later keys override earlier ones.
pub fn parse_param_text(text: &str, path: &Path) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for (line_no, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("");
        let Some(caps) = line_regex().captures(content) else {
            continue;
        };
        let key = caps[1].to_string();
        let value = parse_literal(&caps[2]).map_err(|message| FitError::SettingsSyntax {
            path: path.to_path_buf(),
            line: line_no + 1,
            message: format!("{}: {}", key, message),
        })?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Parse one literal expression into a JSON value
pub fn parse_literal(text: &str) -> std::result::Result<Value, String> {
    let mut parser = LiteralParser {
        src: text.as_bytes(),
        pos: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(format!("unexpected trailing input at column {}", parser.pos + 1));
    }
    Ok(value.into_json())
}

#[derive(Debug, Clone)]
enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    List(Vec<Literal>),
}

impl Literal {
    fn into_json(self) -> Value {
        match self {
            Literal::Int(i) => Value::Number(Number::from(i)),
            Literal::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            Literal::Str(s) => Value::String(s),
            Literal::Bool(b) => Value::Bool(b),
            Literal::None => Value::Null,
            Literal::List(items) => Value::Array(items.into_iter().map(Literal::into_json).collect()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            _ => None,
        }
    }
}

struct LiteralParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl LiteralParser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> std::result::Result<(), String> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{}' at column {}", c as char, self.pos + 1))
        }
    }

    fn expr(&mut self) -> std::result::Result<Literal, String> {
        let mut lhs = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = arith(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn term(&mut self) -> std::result::Result<Literal, String> {
        let mut lhs = self.unary()?;
        while let Some(op @ (b'*' | b'/')) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = arith(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> std::result::Result<Literal, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                match self.unary()? {
                    Literal::Int(i) => Ok(Literal::Int(-i)),
                    Literal::Float(f) => Ok(Literal::Float(-f)),
                    _ => Err("unary minus on a non-number".to_string()),
                }
            }
            Some(b'+') => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> std::result::Result<Literal, String> {
        match self.peek() {
            None => Err("unexpected end of value".to_string()),
            Some(b'[') => {
                self.pos += 1;
                Ok(Literal::List(self.sequence(b']')?.0))
            }
            Some(b'(') => {
                self.pos += 1;
                let (items, trailing_comma) = self.sequence(b')')?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Literal::None))
                } else {
                    Ok(Literal::List(items))
                }
            }
            Some(q @ (b'\'' | b'"')) => self.string(q),
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while self.pos < self.src.len()
                    && (self.src[self.pos].is_ascii_alphanumeric() || self.src[self.pos] == b'_')
                {
                    self.pos += 1;
                }
                match &self.src[start..self.pos] {
                    b"True" => Ok(Literal::Bool(true)),
                    b"False" => Ok(Literal::Bool(false)),
                    b"None" => Ok(Literal::None),
                    other => Err(format!(
                        "unknown name '{}'",
                        String::from_utf8_lossy(other)
                    )),
                }
            }
            Some(c) => Err(format!("unexpected '{}' at column {}", c as char, self.pos + 1)),
        }
    }

    /// Comma-separated items up to `close`; also reports a trailing comma
    fn sequence(&mut self, close: u8) -> std::result::Result<(Vec<Literal>, bool), String> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok((items, trailing_comma));
            }
            items.push(self.expr()?);
            trailing_comma = false;
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    trailing_comma = true;
                }
                Some(c) if c == close => {}
                _ => return Err(format!("expected ',' or '{}'", close as char)),
            }
        }
    }

    fn string(&mut self, quote: u8) -> std::result::Result<Literal, String> {
        self.expect(quote)?;
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] != quote {
            self.pos += 1;
        }
        if self.pos >= self.src.len() {
            return Err("unterminated string".to_string());
        }
        let s = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(Literal::Str(s))
    }

    fn number(&mut self) -> std::result::Result<Literal, String> {
        let start = self.pos;
        let mut is_float = false;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' {
                is_float = true;
                self.pos += 1;
            } else if c == b'e' || c == b'E' {
                is_float = true;
                self.pos += 1;
                if matches!(self.src.get(self.pos).copied(), Some(b'+' | b'-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).map_err(|e| e.to_string())?;
        if is_float {
            text.parse::<f64>()
                .map(Literal::Float)
                .map_err(|e| format!("bad number '{}': {}", text, e))
        } else {
            text.parse::<i64>()
                .map(Literal::Int)
                .map_err(|e| format!("bad integer '{}': {}", text, e))
        }
    }
}

fn arith(op: u8, lhs: Literal, rhs: Literal) -> std::result::Result<Literal, String> {
    if let (Literal::Int(a), Literal::Int(b)) = (&lhs, &rhs) {
        match op {
            b'+' => return Ok(Literal::Int(a + b)),
            b'-' => return Ok(Literal::Int(a - b)),
            b'*' => return Ok(Literal::Int(a * b)),
            _ => {}
        }
    }
    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(format!("operator '{}' needs numbers", op as char)),
    };
    Ok(Literal::Float(match op {
        b'+' => a + b,
        b'-' => a - b,
        b'*' => a * b,
        _ => a / b,
    }))
}

/// Settings for one synthetic image, with keys in `overrides` replacing the defaults
#[cfg(test)]
pub(crate) fn synthetic_settings(overrides: Value) -> Settings {
    let mut map = match serde_json::json!({
        "patch": 11,
        "oversample": 1,
        "splineradius": 2,
        "splinepixelscale": 2.5 / 3600.0,
        "images": ["synthetic.fits"],
        "sciext": "SCI",
        "errext": "ERR",
        "dqext": "DQ",
        "errscale": 1.0,
        "pixel_area_map": null,
        "bad_pixel_list": null,
        "RA0": 150.0,
        "Dec0": 2.0,
        "psfs": ["psf.fits"],
        "epochs": [1],
        "okaydqs": [],
        "psf_has_pix": 1,
        "apodize": 0,
        "fitSNoffset": 0,
        "sndRA_offset": 0.0,
        "sndDec_offset": 0.0,
        "n_iter": 6,
        "SN_centroid_prior_arcsec": 1.0,
        "n_cpu": 2,
        "base_dir": "out",
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    if let Value::Object(extra) = overrides {
        map.extend(extra);
    }
    Settings::from_map(map).expect("synthetic settings are valid")
}
