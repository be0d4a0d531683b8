//! Error kinds for configuration, checkpoint discovery, and tensor shapes.

use std::fmt;
use std::path::PathBuf;

/// Errors with a known cause that callers may want to distinguish.
///
/// Everything else in the pipeline travels as `anyhow::Error` with context;
/// these variants cover the cases where the message alone is not enough.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainerError {
    /// The run configuration is internally inconsistent.
    Configuration {
        /// Human-readable description of the inconsistency.
        message: String,
    },
    /// No checkpoint file with an embedded epoch number was found.
    CheckpointNotFound {
        /// The directory that was scanned.
        dir: PathBuf,
    },
    /// A loaded or computed tensor did not have the expected shape.
    ShapeMismatch {
        /// What the tensor represents.
        name: &'static str,
        /// The dimensions required by the configuration.
        expected: Vec<usize>,
        /// The dimensions actually found.
        got: Vec<usize>,
    },
}

impl fmt::Display for TrainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerError::Configuration { message } => {
                write!(f, "invalid configuration: {message}")
            }
            TrainerError::CheckpointNotFound { dir } => {
                write!(
                    f,
                    "no checkpoint files with an epoch suffix found in {}",
                    dir.display()
                )
            }
            TrainerError::ShapeMismatch {
                name,
                expected,
                got,
            } => {
                write!(f, "{name} has shape {got:?}, expected {expected:?}")
            }
        }
    }
}

impl std::error::Error for TrainerError {}
