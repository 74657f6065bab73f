use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scene-fit")]
#[command(
    about = "Fit a galaxy + transient scene model to multi-epoch image patches",
    long_about = "Reads a parameter file, cuts patches around the transient from every listed \
                  exposure, fits the forward model and writes models, residuals, pulls and \
                  results.txt into the configured base_dir. Log level follows RUST_LOG (default info)."
)]
pub struct Cli {
    /// Parameter file (`key value` lines)
    pub param_file: PathBuf,
}
