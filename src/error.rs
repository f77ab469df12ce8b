use burn::{config::ConfigError, record::RecorderError};
use std::path::PathBuf;
use thiserror::Error;

use crate::{
    dataset::DatasetError, interpreter::InterpreterError, model::ModelError,
    quantize::QuantizeError, tflite::TfliteError,
};

/// Crate level result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Any failure that aborts a training or export run.
#[derive(Error, Debug)]
pub enum Error {
    /// Scanning or decoding the image folders failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// The model configuration is unusable or its weights could not be loaded.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Calibration or graph construction failed.
    #[error(transparent)]
    Quantize(#[from] QuantizeError),

    /// Running the int8 graph failed.
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    /// Reading back an exported model failed.
    #[error(transparent)]
    Tflite(#[from] TfliteError),

    /// Loading or saving a model record failed.
    #[error("record error: {0:?}")]
    Recorder(RecorderError),

    /// The training configuration could not be read.
    #[error("config error: {0:?}")]
    Config(ConfigError),

    /// Writing an artifact failed.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<RecorderError> for Error {
    fn from(err: RecorderError) -> Self {
        Self::Recorder(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
