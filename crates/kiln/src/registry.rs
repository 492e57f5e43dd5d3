//! Process-wide registry of capability exporters.
//!
//! Independent parts of the host contribute bindings to the `kiln` Python
//! module without the embedding layer knowing about them in advance: they
//! call [`register`] during startup, before [`crate::ScriptEngine::init`],
//! and the registry replays every contribution once, the first time the
//! interpreter actually executes `import kiln`.
//!
//! Storage is lazily constructed on first use, so registration order across
//! call sites carries no meaning and no static-initialization ordering is
//! relied upon. Exporters must not assume anything about the order in which
//! they are bound relative to one another.

use std::sync::OnceLock;

use parking_lot::Mutex;
use pyo3::{Bound, PyResult, Python, types::PyModule};
use tracing::{debug, error, warn};

use crate::TRACE_TARGET_ENGINE;

/// One unit of deferred binding work: put some host capabilities into the
/// host module's namespace.
pub trait CapabilityExporter: Send + Sync {
    /// Identity of this exporter, used for deduplication and diagnostics.
    fn name(&self) -> &str;

    /// Bind capabilities into `module`. Called exactly once per process.
    fn bind(&self, py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()>;
}

struct FnExporter<F> {
    name: String,
    bind: F,
}

impl<F> CapabilityExporter for FnExporter<F>
where
    F: Fn(Python<'_>, &Bound<'_, PyModule>) -> PyResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
        (self.bind)(py, module)
    }
}

#[derive(Default)]
struct Registry {
    exporters: Vec<Box<dyn CapabilityExporter>>,
    exported: bool,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(Mutex::default)
}

/// Register an exporter. Must happen before the engine is initialized; once
/// the host module has been imported the binding surface is frozen and late
/// registrations are dropped with a warning. A second exporter with an
/// already-registered name is ignored.
pub fn register(exporter: Box<dyn CapabilityExporter>) {
    let mut reg = registry().lock();
    if reg.exported {
        warn!(
            target: TRACE_TARGET_ENGINE,
            exporter = exporter.name(),
            "capability registered after module export; ignored"
        );
        return;
    }
    if reg.exporters.iter().any(|e| e.name() == exporter.name()) {
        debug!(
            target: TRACE_TARGET_ENGINE,
            exporter = exporter.name(),
            "duplicate capability exporter ignored"
        );
        return;
    }
    reg.exporters.push(exporter);
}

/// Register a closure as an exporter under `name`.
pub fn register_fn<F>(name: impl Into<String>, bind: F)
where
    F: Fn(Python<'_>, &Bound<'_, PyModule>) -> PyResult<()> + Send + Sync + 'static,
{
    register(Box::new(FnExporter {
        name: name.into(),
        bind,
    }));
}

/// Bind every registered exporter into `module`, exactly once each. A
/// failing exporter is reported and does not prevent the rest from binding.
pub(crate) fn export_all(py: Python<'_>, module: &Bound<'_, PyModule>) {
    let mut reg = registry().lock();
    reg.exported = true;
    for exporter in &reg.exporters {
        if let Err(e) = exporter.bind(py, module) {
            error!(
                target: TRACE_TARGET_ENGINE,
                exporter = exporter.name(),
                error = %e,
                "capability exporter failed to bind"
            );
        }
    }
    debug!(
        target: TRACE_TARGET_ENGINE,
        count = reg.exporters.len(),
        "host module populated"
    );
}
