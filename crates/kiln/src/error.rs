use std::path::PathBuf;

use pyo3::{PyErr, Python, prelude::PyTracebackMethods};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Error raised inside the embedded interpreter, captured at the
    /// boundary. Raw `PyErr` values never cross the crate's public API.
    #[error("python error: {cause}")]
    Python {
        cause: String,
        traceback: Option<String>,
    },

    /// Script file passed to `exec_file` does not exist.
    #[error("script not found: {0}")]
    MissingFile(PathBuf),

    /// Startup could not complete; nothing downstream can function.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An execution entry point was called before `init`.
    #[error("scripting engine not initialized")]
    Uninitialized,

    /// Filesystem I/O failure reading a script file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Snippet contains an interior NUL and cannot be handed to the
    /// interpreter.
    #[error("invalid snippet: {0}")]
    InvalidSnippet(#[from] std::ffi::NulError),
}

impl Error {
    /// Capture a Python exception as cause text plus formatted traceback.
    pub fn from_pyerr(py: Python<'_>, e: impl Into<PyErr>) -> Self {
        let e = e.into();
        Self::Python {
            cause: e.to_string(),
            traceback: e.traceback(py).and_then(|t| t.format().ok()),
        }
    }
}
