pub mod engine;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod stream;

/// Name under which the host capability module is importable from Python.
pub const DEFAULT_MODULE_NAME: &str = "kiln";

/// Trace target for engine lifecycle and execution diagnostics.
pub const TRACE_TARGET_ENGINE: &str = "kiln::engine";
/// Trace target for lines written by scripts to stdout/stderr.
pub const TRACE_TARGET_SCRIPT: &str = "kiln::script";

pub use engine::{InitConfig, ScriptEngine};
pub use error::{Error, Result};
pub use registry::{CapabilityExporter, register, register_fn};
pub use scheduler::Scheduler;
pub use stream::{ErrLogWriter, StdLogWriter};
