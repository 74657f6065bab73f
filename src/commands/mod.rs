pub mod run_fit;

pub use run_fit::run_fit;
