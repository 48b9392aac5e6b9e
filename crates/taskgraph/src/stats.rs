use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Counters collected over one `run` of a task graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    /// Units whose first `resume` was issued.
    pub tasks_started: u64,
    /// Requests answered from the cache or by joining an in-flight unit.
    pub cache_hits: u64,
    /// `poll` calls issued on blocked units.
    pub polls: u64,
    /// Units abandoned before finishing.
    pub cancellations: u64,
    /// Units that finished with an error other than an abort.
    pub errors: u64,
    /// Highest number of blocked units alive at once.
    pub peak_blocked: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

impl Default for GraphStats {
    fn default() -> Self {
        Self {
            tasks_started: 0,
            cache_hits: 0,
            polls: 0,
            cancellations: 0,
            errors: 0,
            peak_blocked: 0,
            started_at: None,
            elapsed: Duration::ZERO,
        }
    }
}

impl GraphStats {
    /// Reset every counter and stamp the start of a new run.
    pub fn begin(&mut self) {
        *self = Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        };
    }

    /// Record the end of the run and log a summary.
    pub fn finish(&mut self, runner: &'static str, ok: bool) {
        if let Some(started) = self.started_at {
            self.elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        }
        info!(
            runner,
            ok,
            started = self.tasks_started,
            cache_hits = self.cache_hits,
            polls = self.polls,
            cancelled = self.cancellations,
            errors = self.errors,
            peak_blocked = self.peak_blocked,
            elapsed = ?self.elapsed,
            "task graph run finished"
        );
    }

    pub(crate) fn observe_blocked(&mut self, blocked: usize) {
        self.peak_blocked = self.peak_blocked.max(blocked);
    }
}
