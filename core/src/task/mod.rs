//! Map and reduce tasks.
//!
//! A task is a pure function of its descriptor and the object store: it
//! reads what the descriptor names, writes deterministic keys, and returns a
//! typed result. Descriptors serialize so they can be shipped to workers in
//! other processes.

pub mod map;
pub mod reduce;

pub use map::{MapResult, MapState, MapTask};
pub use reduce::{OutputTarget, ReduceResult, ReduceState, ReduceTask};

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::SortError;
use crate::types::TaskId;

/// Wall-clock time spent in one task phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub seconds: f64,
}

/// Drives a task through its state machine and times every phase.
#[derive(Debug)]
pub struct PhaseTracker<S> {
    task_id: TaskId,
    state: S,
    phase_started: Instant,
    timings: Vec<PhaseTiming>,
}

impl<S> PhaseTracker<S>
where
    S: Copy + Debug + Display + PartialEq,
{
    pub fn new(task_id: TaskId, initial: S) -> Self {
        Self {
            task_id,
            state: initial,
            phase_started: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    fn close_phase(&mut self) {
        let now = Instant::now();
        self.timings.push(PhaseTiming {
            phase: self.state.to_string(),
            seconds: now.duration_since(self.phase_started).as_secs_f64(),
        });
        self.phase_started = now;
    }

    /// Move to `next`, recording how long the current phase took.
    pub fn advance(&mut self, next: S) {
        self.close_phase();
        debug!(task = %self.task_id, from = %self.state, to = %next, "Task phase change");
        self.state = next;
    }

    /// Move to the terminal failure state.
    pub fn fail(&mut self, failed: S, error: &SortError) {
        self.close_phase();
        warn!(
            task = %self.task_id,
            phase = %self.state,
            kind = error.kind(),
            error = %error,
            "Task failed"
        );
        self.state = failed;
    }

    pub fn timings(&self) -> &[PhaseTiming] {
        &self.timings
    }

    pub fn into_timings(self) -> Vec<PhaseTiming> {
        self.timings
    }
}
