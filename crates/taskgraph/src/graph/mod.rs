//! Task graph runners.
//!
//! Both runners drive a root [`Task`](crate::Task) to completion, feeding
//! each unit the results of the children it branches into, and memoize
//! outcomes per cache key for the duration of one [`TaskGraph::run`].
//!
//! - [`SerialTaskGraph`]: depth-first recursion, one unit at a time.
//! - [`ParallelTaskGraph`]: keeps several non-exclusive process units
//!   alive at once and multiplexes them through `poll`/`wait`.

mod cache;
mod parallel;
mod serial;

pub use parallel::ParallelTaskGraph;
pub use serial::SerialTaskGraph;

use crate::error::Outcome;
use crate::stats::GraphStats;
use crate::task::{BoxTask, Task};

pub trait TaskGraph {
    /// Run `root` and everything it branches into. The result cache is
    /// empty at the start of every call.
    fn run(&mut self, root: BoxTask) -> Outcome;

    /// Counters of the most recent run.
    fn stats(&self) -> &GraphStats;

    fn run_task<T>(&mut self, root: T) -> Outcome
    where
        T: Task + 'static,
        Self: Sized,
    {
        self.run(Box::new(root))
    }
}
