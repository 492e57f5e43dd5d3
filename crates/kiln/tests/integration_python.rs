//! End-to-end tests against a real embedded interpreter.
//!
//! The interpreter and the capability registry are process-global, so every
//! test goes through `setup()`: it registers the test exporters and then
//! initializes the shared engine exactly once. Log assertions use a
//! thread-scoped capturing subscriber, which keeps concurrently running
//! tests from seeing each other's records.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use kiln::{InitConfig, ScriptEngine, TRACE_TARGET_ENGINE, TRACE_TARGET_SCRIPT};
use pyo3::prelude::PyModuleMethods as _;
use tracing::Level;
use tracing_subscriber::{Registry, layer::SubscriberExt};

static EXPORT_A_CALLS: AtomicUsize = AtomicUsize::new(0);
static EXPORT_B_CALLS: AtomicUsize = AtomicUsize::new(0);

fn setup() -> &'static ScriptEngine {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        kiln::registry::register_fn("test-capability-a", |_py, m| {
            EXPORT_A_CALLS.fetch_add(1, Ordering::SeqCst);
            m.add("test_flag_a", 1)
        });
        kiln::registry::register_fn("test-capability-b", |_py, m| {
            EXPORT_B_CALLS.fetch_add(1, Ordering::SeqCst);
            m.add("test_flag_b", 2)
        });
        // Same identity again: must be ignored, not bound twice.
        kiln::registry::register_fn("test-capability-a", |_py, m| {
            EXPORT_A_CALLS.fetch_add(1, Ordering::SeqCst);
            m.add("test_flag_a", 999)
        });

        let config = InitConfig::new().argv(["kiln-test"]);
        ScriptEngine::global()
            .init(&config)
            .expect("engine init failed");
    });
    ScriptEngine::global()
}

#[derive(Debug, Clone)]
struct Record {
    level: Level,
    target: String,
    message: String,
}

#[derive(Clone, Default)]
struct Capture {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Capture {
    fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    fn count(&self, level: Level, target: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.level == level && r.target == target)
            .count()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Capture {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.records.lock().unwrap().push(Record {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

fn captured<R>(f: impl FnOnce() -> R) -> (R, Capture) {
    let capture = Capture::default();
    let subscriber = Registry::default().with(capture.clone());
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, capture)
}

#[test]
fn init_is_idempotent() {
    let engine = setup();

    // A second init must be a no-op: no exporter re-run, no argv reseed.
    let other = InitConfig::new().argv(["something-else"]);
    engine.init(&other).unwrap();

    engine
        .exec("import sys\nassert sys.argv[0] == \"kiln-test\"")
        .unwrap();
    assert_eq!(EXPORT_A_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn exporters_bind_exactly_once() {
    let engine = setup();
    assert_eq!(EXPORT_A_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(EXPORT_B_CALLS.load(Ordering::SeqCst), 1);

    // Both contributions landed in the host module namespace; the duplicate
    // registration of test-capability-a never ran.
    engine
        .exec("import kiln\nassert kiln.test_flag_a == 1\nassert kiln.test_flag_b == 2")
        .unwrap();
}

#[test]
fn stdout_lines_reach_host_logging() {
    let engine = setup();

    let (result, capture) = captured(|| engine.exec(r#"print("hello stream")"#));
    result.unwrap();
    let records = capture.records();
    let lines: Vec<_> = records
        .iter()
        .filter(|r| r.target == TRACE_TARGET_SCRIPT && r.level == Level::INFO)
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "hello stream");
}

#[test]
fn partial_chunks_buffer_into_one_record() {
    let engine = setup();

    let (result, capture) = captured(|| {
        engine.exec(
            "import sys\n\
             sys.stdout.write(\"ab\")\n\
             sys.stdout.write(\"cd\")\n\
             sys.stdout.write(\"\\n\")",
        )
    });
    result.unwrap();
    let records = capture.records();
    let lines: Vec<_> = records
        .iter()
        .filter(|r| r.target == TRACE_TARGET_SCRIPT)
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "abcd");
}

#[test]
fn stderr_lines_log_at_error_level() {
    let engine = setup();

    let (result, capture) = captured(|| {
        engine.exec(
            "import sys\n\
             sys.stderr.write(\"bad news\")\n\
             sys.stderr.write(\"\\n\")",
        )
    });
    result.unwrap();
    assert_eq!(capture.count(Level::ERROR, TRACE_TARGET_SCRIPT), 1);
    assert!(
        capture
            .records()
            .iter()
            .any(|r| r.message == "bad news" && r.level == Level::ERROR)
    );
}

#[test]
fn suppressed_errors_stay_silent() {
    let engine = setup();

    let (result, capture) = captured(|| engine.exec_suppressed("this is not python"));
    assert!(matches!(result, Err(kiln::Error::Python { .. })));
    assert_eq!(capture.count(Level::ERROR, TRACE_TARGET_ENGINE), 0);
}

#[test]
fn unsuppressed_errors_are_logged() {
    let engine = setup();

    let (result, capture) = captured(|| engine.exec("this is not python"));
    assert!(matches!(result, Err(kiln::Error::Python { .. })));
    let errors: Vec<_> = capture
        .records()
        .into_iter()
        .filter(|r| r.level == Level::ERROR && r.target == TRACE_TARGET_ENGINE)
        .collect();
    assert!(!errors.is_empty());
    assert!(errors.iter().any(|r| r.message.contains("unhandled script error")));
}

#[test]
fn exec_file_missing_path_fails_fast() {
    let engine = setup();

    let (result, capture) =
        captured(|| engine.exec_file("/no/such/place/kiln_missing_script.py"));
    assert!(matches!(result, Err(kiln::Error::MissingFile(_))));
    assert_eq!(capture.count(Level::WARN, TRACE_TARGET_ENGINE), 1);
}

#[test]
fn exec_file_runs_contents_in_shared_namespace() {
    let engine = setup();

    let mut file = tempfile::Builder::new()
        .suffix(".py")
        .tempfile()
        .unwrap();
    file.write_all(b"_kiln_file_ran = 41\n_kiln_file_ran += 1\n")
        .unwrap();
    file.flush().unwrap();

    engine.exec_file(file.path()).unwrap();
    engine.exec("assert _kiln_file_ran == 42").unwrap();
}

#[test]
fn script_directory_widens_module_resolution() {
    let engine = setup();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("kiln_probe_mod.py"), "probe_value = 7\n").unwrap();

    engine.add_script_directory(dir.path()).unwrap();
    let (result, capture) = captured(|| engine.import_module("kiln_probe_mod"));
    result.unwrap();
    engine.exec("assert kiln_probe_mod.probe_value == 7").unwrap();
    assert!(
        capture
            .records()
            .iter()
            .any(|r| r.level == Level::DEBUG && r.message == "imported module: kiln_probe_mod")
    );
}

#[test]
fn missing_script_directory_is_a_warning_only() {
    let engine = setup();

    let (result, capture) =
        captured(|| engine.add_script_directory("/no/such/place/kiln_scripts"));
    result.unwrap();
    assert_eq!(capture.count(Level::WARN, TRACE_TARGET_ENGINE), 1);
    engine
        .exec("import sys\nassert \"/no/such/place/kiln_scripts\" not in sys.path")
        .unwrap();
}

#[test]
fn import_module_round_trip() {
    let engine = setup();

    let (result, capture) = captured(|| engine.import_module("os"));
    result.unwrap();
    assert!(
        capture
            .records()
            .iter()
            .any(|r| r.level == Level::DEBUG && r.message == "imported module: os")
    );

    let (result, capture) = captured(|| engine.import_module("kiln_does_not_exist_123"));
    assert!(matches!(result, Err(kiln::Error::Python { .. })));
    assert!(
        capture
            .records()
            .iter()
            .any(|r| r.level == Level::ERROR
                && r.message.contains("kiln_does_not_exist_123"))
    );
}

#[test]
fn late_registration_is_rejected() {
    let engine = setup();

    let ((), capture) = captured(|| {
        kiln::registry::register_fn("late-capability", |_py, m| m.add("late_flag", 1));
    });
    assert_eq!(capture.count(Level::WARN, TRACE_TARGET_ENGINE), 1);
    engine
        .exec("import kiln\nassert not hasattr(kiln, 'late_flag')")
        .unwrap();
}

// Single test for the whole scheduler contract: the queue is 1:1 with the
// process-wide engine, so splitting this up would let runs consume each
// other's due events.
#[test]
fn scheduler_runs_due_snippets() {
    let engine = setup();
    let scheduler = engine.scheduler();

    // Due events run in first-in-first-out order.
    scheduler.schedule(Duration::ZERO, "_kiln_sched_a = 1");
    scheduler.schedule(Duration::ZERO, "_kiln_sched_b = _kiln_sched_a + 1");
    let (ran, _capture) = captured(|| scheduler.run_ready(engine));
    assert_eq!(ran, 2);
    engine.exec("assert _kiln_sched_b == 2").unwrap();

    // A failing snippet is consumed and does not stop later events.
    scheduler.schedule(Duration::ZERO, "definitely not python");
    scheduler.schedule(Duration::ZERO, "_kiln_sched_ok = True");
    let (ran, _capture) = captured(|| scheduler.run_ready(engine));
    assert_eq!(ran, 1);
    engine.exec("assert _kiln_sched_ok").unwrap();

    // Far-future work stays queued.
    scheduler.schedule(Duration::from_secs(3600), "_kiln_sched_far = 1");
    assert!(scheduler.pending() >= 1);
}
