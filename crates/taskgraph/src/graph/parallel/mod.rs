//! Multiplexing task graph runner.
//!
//! Split into focused submodules:
//! - `node`: arena entries, waiters and branch joins
//! - `dispatch`: stepping nodes, delivering outcomes, cancellation

mod dispatch;
mod node;

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info};

use self::node::{Node, NodeId, Waiter};
use super::cache::ResultCache;
use super::TaskGraph;
use crate::config::EngineConfig;
use crate::error::{Outcome, TaskError};
use crate::stats::GraphStats;
use crate::task::BoxTask;

/// Runner that overlaps non-exclusive process units.
///
/// At most `jobs` blocked units are alive at once. Exclusive units run
/// only after every blocked unit has finished. A unit already computing
/// in another branch is joined rather than started again.
pub struct ParallelTaskGraph {
    jobs: usize,
    poll_interval: Duration,
    arena: Vec<Option<Node>>,
    ready: VecDeque<NodeId>,
    blocked: VecDeque<NodeId>,
    cache: ResultCache<NodeId>,
    root_outcome: Option<Outcome>,
    stats: GraphStats,
}

impl ParallelTaskGraph {
    /// `jobs == 0` means one job per available CPU.
    pub fn new(jobs: usize) -> Self {
        let config = EngineConfig {
            jobs,
            ..EngineConfig::default()
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            jobs: config.resolved_jobs(),
            poll_interval: config.poll_interval(),
            arena: Vec::new(),
            ready: VecDeque::new(),
            blocked: VecDeque::new(),
            cache: ResultCache::new(),
            root_outcome: None,
            stats: GraphStats::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    fn live_nodes(&self) -> usize {
        self.arena.iter().filter(|n| n.is_some()).count()
    }

    fn is_exclusive(&self, id: NodeId) -> bool {
        self.arena[id]
            .as_ref()
            .is_some_and(|n| n.task.is_exclusive())
    }

    fn drive(&mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.root_outcome.take() {
                return outcome;
            }

            if !self.ready.is_empty() && self.blocked.len() < self.jobs {
                let Some(id) = self.ready.pop_front() else {
                    continue;
                };
                if !self.blocked.is_empty() && self.is_exclusive(id) {
                    self.ready.push_front(id);
                    self.drain_blocked();
                    continue;
                }
                self.step(id);
                continue;
            }

            if self.blocked.is_empty() {
                if self.ready.is_empty() {
                    return Err(TaskError::Stalled(self.live_nodes()));
                }
                continue;
            }

            if !self.poll_blocked() {
                if self.blocked.len() == 1 {
                    self.wait_one();
                } else {
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }

    /// One round-robin pass over the blocked units. Returns whether any
    /// of them made progress.
    fn poll_blocked(&mut self) -> bool {
        let mut progressed = false;
        for _ in 0..self.blocked.len() {
            let Some(id) = self.blocked.pop_front() else {
                break;
            };
            let Some(node) = self.arena[id].as_mut() else {
                continue;
            };
            self.stats.polls += 1;
            if node.task.poll() {
                progressed = true;
                self.step(id);
            } else {
                self.blocked.push_back(id);
            }
        }
        progressed
    }

    fn wait_one(&mut self) {
        let Some(id) = self.blocked.pop_front() else {
            return;
        };
        if let Some(node) = self.arena[id].as_mut() {
            node.task.wait();
            self.step(id);
        }
    }

    /// Finish every blocked unit before an exclusive one takes the thread.
    fn drain_blocked(&mut self) {
        debug!(blocked = self.blocked.len(), "draining before exclusive task");
        while !self.blocked.is_empty() {
            self.wait_one();
        }
    }

    /// Close whatever is left once the root has an outcome.
    fn abandon_all(&mut self) {
        let leftovers: Vec<NodeId> = (0..self.arena.len())
            .filter(|&id| self.arena[id].is_some())
            .collect();
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "closing tasks left after run");
        }
        for id in leftovers {
            self.cancel(id);
        }
        self.arena.clear();
        self.ready.clear();
        self.blocked.clear();
    }
}

impl TaskGraph for ParallelTaskGraph {
    fn run(&mut self, root: BoxTask) -> Outcome {
        self.cache.clear();
        self.stats.begin();
        self.root_outcome = None;
        debug!(jobs = self.jobs, "parallel run started");

        self.request(root, Waiter::Root);
        let outcome = self.drive();

        self.abandon_all();
        self.cache.clear();
        self.stats.finish("parallel", outcome.is_ok());
        outcome
    }

    fn stats(&self) -> &GraphStats {
        &self.stats
    }
}

impl std::fmt::Debug for ParallelTaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTaskGraph")
            .field("jobs", &self.jobs)
            .field("poll_interval", &self.poll_interval)
            .field("live", &self.live_nodes())
            .field("ready", &self.ready.len())
            .field("blocked", &self.blocked.len())
            .finish()
    }
}
