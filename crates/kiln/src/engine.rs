//! Lifecycle and execution entry points for the embedded interpreter.
//!
//! One interpreter per process, one shared namespace (`__main__.__dict__`),
//! process-scoped lifetime: constructed lazily, never restarted. pyo3 does
//! not finalize the interpreter at teardown, which may leak minor
//! interpreter state; the embedding accepts that.
//!
//! Callers are expected to serialize use of the execution entry points.
//! `init` must complete before concurrent use begins; the internal mutex
//! protects engine state, not script-level consistency.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use pyo3::intern;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyModule};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::stream::host_module;
use crate::{DEFAULT_MODULE_NAME, TRACE_TARGET_ENGINE};

/// Fixed startup program: import the host module and rebind the
/// interpreter's output streams to the log writers. Executed with
/// suppressed errors.
const BOOTSTRAP: &str = "import kiln\n\
                         import sys\n\
                         sys.stdout = kiln.StdLogWriter()\n\
                         sys.stderr = kiln.ErrLogWriter()\n";

#[derive(Clone, Debug, Default)]
pub struct InitConfig {
    /// Seeds `sys.argv`; a single placeholder program name when empty.
    pub argv: Vec<String>,
    /// Resource root of the currently loaded mod, from the host's resource
    /// locator. Appended to the script search path ahead of the working
    /// directory so mod-specific scripts shadow generic ones.
    pub mod_root: Option<PathBuf>,
}

impl InitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn mod_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.mod_root = Some(root.into());
        self
    }
}

#[derive(Default)]
struct EngineState {
    main_module: Option<Py<PyModule>>,
    globals: Option<Py<PyDict>>,
    initialized: bool,
}

pub struct ScriptEngine {
    state: Mutex<EngineState>,
    scheduler: Scheduler,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            scheduler: Scheduler::new(),
        }
    }

    /// Process-wide instance, lazily constructed on first access.
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<ScriptEngine> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    /// Start the interpreter and establish the shared namespace. Idempotent;
    /// calls after the first are no-ops.
    ///
    /// The host module is registered with the interpreter's module table
    /// strictly before startup; failure there is fatal since nothing
    /// downstream can function without the module.
    pub fn init(&self, config: &InitConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(());
        }

        // The module table is consulted at interpreter start; registering
        // into a running interpreter cannot take effect.
        if unsafe { pyo3::ffi::Py_IsInitialized() } != 0 {
            return Err(Error::Init(format!(
                "interpreter already running; cannot register '{DEFAULT_MODULE_NAME}' module"
            )));
        }
        pyo3::append_to_inittab!(host_module);

        // Py_InitializeEx(0): no host signal handlers.
        Python::initialize();

        Python::attach(|py| -> Result<()> {
            let sys = py.import(intern!(py, "sys")).map_err(|e| Error::from_pyerr(py, e))?;
            let argv: Vec<&str> = if config.argv.is_empty() {
                vec![DEFAULT_MODULE_NAME]
            } else {
                config.argv.iter().map(String::as_str).collect()
            };
            sys.setattr(
                intern!(py, "argv"),
                PyList::new(py, argv).map_err(|e| Error::from_pyerr(py, e))?,
            )
            .map_err(|e| Error::from_pyerr(py, e))?;

            let main = py
                .import(intern!(py, "__main__"))
                .map_err(|e| Error::from_pyerr(py, e))?;
            let globals = main.dict();
            state.main_module = Some(main.clone().unbind());
            state.globals = Some(globals.clone().unbind());
            debug!(target: TRACE_TARGET_ENGINE, "loaded __main__ namespace");

            // Mod scripts first, then the working directory.
            if let Some(root) = &config.mod_root {
                Self::append_sys_path(py, root)?;
            }
            Self::append_sys_path(py, Path::new("."))?;
            debug!(target: TRACE_TARGET_ENGINE, "initialized script search path");

            // Best-effort: a failure leaves the default streams in place.
            let _ = Self::run_in(py, &globals, BOOTSTRAP);
            Ok(())
        })?;

        state.initialized = true;
        info!(target: TRACE_TARGET_ENGINE, "scripting engine initialized");
        Ok(())
    }

    /// Reserved for runtime-state reset. Deliberately a no-op: the
    /// interpreter is not restartable within a process, and whether any
    /// state should be reset here is an open design question.
    pub fn destroy(&self) {}

    /// Execute `import <name>` in the shared namespace.
    pub fn import_module(&self, name: &str) -> Result<()> {
        self.with_globals(|py, globals| {
            match Self::run_in(py, globals, &format!("import {name}\n")) {
                Ok(()) => {
                    debug!(target: TRACE_TARGET_ENGINE, "imported module: {name}");
                    Ok(())
                }
                Err(e) => {
                    error!(target: TRACE_TARGET_ENGINE, "error importing module: {name}");
                    Self::log_error(py, globals, &e);
                    Err(e)
                }
            }
        })
    }

    /// Execute a script file in the shared namespace. Fails fast when the
    /// file does not exist, without touching the interpreter.
    pub fn exec_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(target: TRACE_TARGET_ENGINE, "executing script: {}", path.display());
        if !path.exists() {
            warn!(
                target: TRACE_TARGET_ENGINE,
                "could not find script file: {}",
                path.display()
            );
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let source = std::fs::read_to_string(path)?;
        self.with_globals(|py, globals| match Self::run_in(py, globals, &source) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    target: TRACE_TARGET_ENGINE,
                    "error executing script: {}",
                    path.display()
                );
                Self::log_error(py, globals, &e);
                Err(e)
            }
        })
    }

    /// Execute an inline code fragment in the shared namespace, reporting
    /// failures through the standard error path.
    pub fn exec(&self, snippet: &str) -> Result<()> {
        self.with_globals(|py, globals| match Self::run_in(py, globals, snippet) {
            Ok(()) => Ok(()),
            Err(e) => {
                Self::log_error(py, globals, &e);
                Err(e)
            }
        })
    }

    /// Execute an inline code fragment, discarding the interpreter's error
    /// state silently on failure. Used for best-effort bootstrap and config
    /// snippets whose failure the caller handles via the returned result.
    pub fn exec_suppressed(&self, snippet: &str) -> Result<()> {
        self.with_globals(|py, globals| Self::run_in(py, globals, snippet))
    }

    /// Append `path` to the interpreter's module search path if it exists;
    /// otherwise log a warning and change nothing.
    pub fn add_script_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.with_globals(|py, _| Self::append_sys_path(py, &path))
    }

    /// Owning handle to the interpreter's top-level module.
    pub fn main_module(&self, py: Python<'_>) -> Result<Py<PyModule>> {
        let state = self.state.lock();
        state
            .main_module
            .as_ref()
            .filter(|_| state.initialized)
            .map(|m| m.clone_ref(py))
            .ok_or(Error::Uninitialized)
    }

    /// The scheduler associated 1:1 with this engine.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn with_globals<R>(
        &self,
        f: impl FnOnce(Python<'_>, &Bound<'_, PyDict>) -> Result<R>,
    ) -> Result<R> {
        // The interpreter is only attachable once `init` has run; check the
        // flag first so an uninitialized engine fails instead of panicking.
        if !self.state.lock().initialized {
            return Err(Error::Uninitialized);
        }
        Python::attach(|py| {
            let globals = {
                let state = self.state.lock();
                state
                    .globals
                    .as_ref()
                    .ok_or(Error::Uninitialized)?
                    .clone_ref(py)
            };
            f(py, globals.bind(py))
        })
    }

    fn run_in(py: Python<'_>, globals: &Bound<'_, PyDict>, code: &str) -> Result<()> {
        let code = CString::new(code)?;
        py.run(code.as_c_str(), Some(globals), None)
            .map_err(|e| Error::from_pyerr(py, e))
    }

    fn append_sys_path(py: Python<'_>, dir: &Path) -> Result<()> {
        if !dir.exists() {
            warn!(
                target: TRACE_TARGET_ENGINE,
                "script directory '{}' does not exist",
                dir.display()
            );
            return Ok(());
        }
        let sys = py.import(intern!(py, "sys")).map_err(|e| Error::from_pyerr(py, e))?;
        let path = sys
            .getattr(intern!(py, "path"))
            .map_err(|e| Error::from_pyerr(py, e))?;
        let path = path
            .downcast::<PyList>()
            .map_err(|e| Error::from_pyerr(py, e))?;
        path.append(dir.to_string_lossy().into_owned())
            .map_err(|e| Error::from_pyerr(py, e))
    }

    /// Standard error path for unsuppressed script failures. Reaching this
    /// during development usually means a caller should have handled the
    /// failure explicitly, hence the loud record.
    fn log_error(py: Python<'_>, globals: &Bound<'_, PyDict>, e: &Error) {
        if let Error::Python { cause, traceback } = e {
            match traceback {
                Some(tb) => {
                    error!(target: TRACE_TARGET_ENGINE, "unhandled script error: {cause}\n{tb}");
                }
                None => {
                    error!(target: TRACE_TARGET_ENGINE, "unhandled script error: {cause}");
                }
            }
        }
        if cfg!(debug_assertions) {
            Self::log_post_error_diagnostics(py, globals);
        }
    }

    fn log_post_error_diagnostics(py: Python<'_>, globals: &Bound<'_, PyDict>) {
        let report = || -> PyResult<()> {
            let sys = py.import(intern!(py, "sys"))?;
            let sys_path = sys.getattr(intern!(py, "path"))?.str()?.to_string();
            let namespace = globals.keys().str()?.to_string();
            let cwd = std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            debug!(
                target: TRACE_TARGET_ENGINE,
                sys_path = %sys_path,
                cwd = %cwd,
                namespace = %namespace,
                "post-error interpreter state"
            );
            Ok(())
        };
        if report().is_err() {
            error!(target: TRACE_TARGET_ENGINE, "could not print post-error information");
        }
    }
}
