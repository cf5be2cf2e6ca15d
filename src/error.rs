use crate::fitting::common::error::FitError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResofitError {
    /// The data could not be fitted
    #[error("{0}")]
    Fit(#[from] FitError),

    /// Unable to read an input file
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    /// Malformed line in a text trace
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
}
