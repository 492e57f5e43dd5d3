//! Deferred execution of script snippets.
//!
//! The scheduler queues inline snippets to run once a delay has elapsed.
//! The host drives it by calling [`Scheduler::run_ready`] from its update
//! loop; due snippets execute in due-time order, ties broken
//! first-in-first-out. A failing snippet is reported through the engine's
//! standard error path and does not stop later events.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::TRACE_TARGET_ENGINE;
use crate::engine::ScriptEngine;

struct Event {
    due: Instant,
    seq: u64,
    snippet: String,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Inner {
    queue: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
}

/// Timed snippet queue, associated 1:1 with a [`ScriptEngine`].
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `snippet` to run no earlier than now + `delay`.
    pub fn schedule(&self, delay: Duration, snippet: impl Into<String>) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(Reverse(Event {
            due: Instant::now() + delay,
            seq,
            snippet: snippet.into(),
        }));
    }

    /// Number of snippets still waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Execute every due snippet against `engine`, returning how many ran
    /// successfully. Due events are consumed whether or not they succeed.
    pub fn run_ready(&self, engine: &ScriptEngine) -> usize {
        let now = Instant::now();
        let due: Vec<Event> = {
            let mut inner = self.inner.lock();
            let mut due = Vec::new();
            while inner.queue.peek().is_some_and(|Reverse(e)| e.due <= now) {
                if let Some(Reverse(e)) = inner.queue.pop() {
                    due.push(e);
                }
            }
            due
        };

        let mut ran = 0;
        for event in due {
            debug!(
                target: TRACE_TARGET_ENGINE,
                seq = event.seq,
                "running scheduled snippet"
            );
            if engine.exec(&event.snippet).is_ok() {
                ran += 1;
            }
        }
        ran
    }
}
