pub mod cli;
pub mod commands;
pub mod error;
pub mod fft;
pub mod fit;
pub mod fits;
pub mod image_source;
pub mod model;
pub mod params;
pub mod patch;
pub mod psf;
pub mod pulls;
pub mod report;
pub mod settings;
pub mod sky_fit;
pub mod solver;
pub mod spline;
pub mod wcs;

#[cfg(test)]
mod test_end_to_end;

// Re-export commonly used items
pub use error::{FitError, Result};
pub use fit::{FitOrchestrator, FitResult};
pub use settings::Settings;
