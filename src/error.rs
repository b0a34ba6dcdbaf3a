use burn::record::RecorderError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while preparing or running a training session.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("side-channel directory {0} does not exist")]
    MissingSideChannel(PathBuf),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("no images found in {0}")]
    EmptyDomain(PathBuf),

    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to load checkpoint {path}: {reason:?}")]
    CheckpointLoad { path: PathBuf, reason: RecorderError },

    #[error("failed to save checkpoint {path}: {reason:?}")]
    CheckpointSave { path: PathBuf, reason: RecorderError },

    #[error("non-finite {term} loss at step {step}")]
    NonFinite { term: &'static str, step: usize },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("failed to parse {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure produced inside a data-loader worker.
///
/// Kept separate from [`TrainError`] because batches cross thread boundaries
/// and must be cheap to clone.
#[derive(Debug, Clone, Error)]
#[error("batch assembly failed: {0}")]
pub struct BatchError(pub String);

pub type TrainResult<T> = std::result::Result<T, TrainError>;
