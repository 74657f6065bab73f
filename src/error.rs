/// Error types for the scene-modelling fit
///
/// Structural configuration problems are errors; per-pixel data problems are
/// masked where they occur and never reach this type.
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FitError>;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("settings file {path}: line {line}: {message}")]
    SettingsSyntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("missing required setting `{0}`")]
    MissingSetting(&'static str),

    #[error("invalid setting `{key}`: {message}")]
    InvalidSetting { key: &'static str, message: String },

    #[error("`{key}` has wrong length: expected {expected}, got {got}")]
    ListLength {
        key: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("PSF {0} has multiple pixels at the same maximum")]
    AmbiguousPsfPeak(String),

    #[error("PSF {name}: {message}")]
    PsfCentering { name: String, message: String },

    #[error("spline mesh overfills patch for {image}: sampled Dec range {dec_range:.3e} deg <= required {required:.3e} deg")]
    MeshOverfillsPatch {
        image: String,
        dec_range: f64,
        required: f64,
    },

    #[error("image {image}: {message}")]
    Ingest { image: String, message: String },

    #[error("parameter vector has length {got}, layout expects {expected}")]
    ParameterLength { expected: usize, got: usize },

    #[error("solver failed: {0}")]
    Solver(String),

    #[error("no outer iterations were run")]
    NoIterations,

    #[error("FITS error for {path}: {message}")]
    Fits { path: PathBuf, message: String },

    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("report formatting failed")]
    Format(#[from] std::fmt::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl FitError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FitError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn fits(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        FitError::Fits {
            path: path.into(),
            message: message.into(),
        }
    }
}
