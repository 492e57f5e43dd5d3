//! Bridges the interpreter's text output streams into host logging.
//!
//! Python may call `sys.stdout.write` with arbitrary chunking, not whole
//! lines; `print("x")` typically arrives as `"x"` followed by a lone
//! `"\n"`. The writers accumulate chunks and emit one tracing record per
//! completed line. An unterminated trailing partial line is dropped when the
//! writer goes away.

use pyo3::prelude::*;
use tracing::{error, info};

use crate::TRACE_TARGET_SCRIPT;

/// Chunk accumulator with flush-on-newline semantics: a chunk that is
/// exactly `"\n"` completes the buffered line.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    /// Feed one chunk; returns the completed line when `chunk` terminates
    /// one.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if chunk == "\n" {
            Some(std::mem::take(&mut self.buf))
        } else {
            self.buf.push_str(chunk);
            None
        }
    }
}

/// `sys.stdout` replacement; completed lines go to the script trace target
/// at info level.
#[pyclass]
#[derive(Default)]
pub struct StdLogWriter {
    buf: LineBuffer,
}

#[pymethods]
impl StdLogWriter {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, text: &str) {
        if let Some(line) = self.buf.push(text) {
            info!(target: TRACE_TARGET_SCRIPT, "{line}");
        }
    }

    /// Flushing is implicit per line.
    fn flush(&self) {}

    fn close(&self) {}
}

/// `sys.stderr` replacement; completed lines go to the script trace target
/// at error level.
#[pyclass]
#[derive(Default)]
pub struct ErrLogWriter {
    buf: LineBuffer,
}

#[pymethods]
impl ErrLogWriter {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, text: &str) {
        if let Some(line) = self.buf.push(text) {
            error!(target: TRACE_TARGET_SCRIPT, "{line}");
        }
    }

    fn flush(&self) {}

    fn close(&self) {}
}

/// The host capability module. Registered with the interpreter's module
/// table before startup; the first `import kiln` binds the stream writers
/// and replays every registered capability exporter.
#[pymodule]
#[pyo3(name = "kiln")]
pub mod host_module {
    use pyo3::{Bound, PyResult, types::PyModule};

    #[pymodule_export]
    use super::{ErrLogWriter, StdLogWriter};

    #[pymodule_init]
    fn init(m: &Bound<'_, PyModule>) -> PyResult<()> {
        crate::registry::export_all(m.py(), m);
        Ok(())
    }
}
