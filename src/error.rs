use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The input path does not exist.
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be decoded as audio.
    #[error("Could not decode {}: {}", .path.display(), .reason)]
    Decode { path: PathBuf, reason: String },

    /// Invalid accuracy level, technique name, hash style or parameter.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    /// A batch was interrupted; partial results were discarded.
    #[error("Cancelled after {:.2}s", .elapsed.as_secs_f64())]
    Cancelled { elapsed: Duration },
}

impl Error {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that are isolated to a single file inside a batch.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Decode { .. } | Error::Io(_))
    }
}
