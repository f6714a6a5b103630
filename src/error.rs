use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset directory '{0}' already exists")]
    DatasetExists(PathBuf),

    #[error("invalid split plan: {0}")]
    InvalidSplit(String),

    #[error("expected exactly two class directories in '{dir}', found {found:?}")]
    ClassLayout { dir: PathBuf, found: Vec<String> },

    #[error("failed to read image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to decode image '{path}': {message}")]
    Decode { path: PathBuf, message: String },

    #[error("record error: {0}")]
    Record(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches the offending path to an I/O error.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
