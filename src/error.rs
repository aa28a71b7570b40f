//! Error taxonomy for a conversion run.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for conversion operations
pub type ConvertResult<T> = std::result::Result<T, ConvertError>;

/// Errors that can end a conversion pipeline.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The user cancelled the run
    #[error("conversion cancelled")]
    Cancelled,

    /// The input directory does not exist
    #[error("input directory not found: {}", path.display())]
    InputMissing { path: PathBuf },

    /// The builder could not be started at all
    #[error("failed to start builder '{program}': {source}")]
    BuilderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The builder exited with a nonzero status during the real build
    #[error("builder exited with code {code}\n{output}")]
    BuilderExitNonzero { code: i32, output: String },

    /// The builder reported success but left no image behind
    #[error("builder exited successfully but the output file was not created: {}", path.display())]
    BuilderOutputMissing { path: PathBuf },

    /// Appending the metadata trailer failed
    #[error("failed to write trailer to {}: {message}", path.display())]
    TrailerWrite { path: PathBuf, message: String },

    /// A trailer could not be parsed back from an image
    #[error("malformed trailer in {}: {message}", path.display())]
    TrailerCorrupt { path: PathBuf, message: String },

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Whether this error is a user cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConvertError::Cancelled)
    }

    pub(crate) fn trailer(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ConvertError::TrailerWrite {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ConvertError::TrailerCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }
}
