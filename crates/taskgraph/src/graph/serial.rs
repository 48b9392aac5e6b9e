use tracing::{debug, warn};

use super::cache::{Entry, ResultCache};
use super::TaskGraph;
use crate::error::{Outcome, TaskError};
use crate::stats::GraphStats;
use crate::task::{BoxTask, Signal, Task};
use crate::value::Value;

/// Depth-first runner: a unit's children run to completion, one after
/// another, before the unit resumes.
///
/// A branch stops at its first failing child; the children after it are
/// closed without ever being started.
#[derive(Debug)]
pub struct SerialTaskGraph {
    cache: ResultCache<()>,
    stats: GraphStats,
}

impl Default for SerialTaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTaskGraph {
    pub fn new() -> Self {
        Self {
            cache: ResultCache::new(),
            stats: GraphStats::default(),
        }
    }

    fn execute(&mut self, mut task: BoxTask) -> Outcome {
        let key = task.cache_key();
        if let Some(key) = &key {
            match self.cache.get(key) {
                Some(Entry::Resolved(outcome)) => {
                    let outcome = outcome.clone();
                    self.stats.cache_hits += 1;
                    self.discard(task);
                    return outcome;
                }
                Some(Entry::InProgress(())) => {
                    debug!(task = %key, "cyclic request");
                    self.discard(task);
                    return Err(TaskError::Cyclic(key.clone()));
                }
                None => self.cache.begin(key.clone(), ()),
            }
        }

        self.stats.tasks_started += 1;
        debug!(task = %task.label(), "task started");
        let mut outcome = self.drive(task.as_mut());
        if let Err(e) = task.close() {
            outcome = Err(e);
        }
        match &outcome {
            Ok(_) => debug!(task = %task.label(), "task finished"),
            Err(e) if e.is_abort() => debug!(task = %task.label(), "task aborted"),
            Err(e) => {
                self.stats.errors += 1;
                debug!(task = %task.label(), error = %e, "task failed");
            }
        }
        if let Some(key) = key {
            self.cache.resolve(key, outcome.clone());
        }
        outcome
    }

    fn drive(&mut self, task: &mut dyn Task) -> Outcome {
        let mut step = task.resume(Value::None);
        loop {
            step = match step? {
                Signal::Return(value) => return Ok(value),
                Signal::Block => {
                    task.wait();
                    task.resume(Value::None)
                }
                Signal::Await(child) => match self.execute(child) {
                    Ok(value) | Err(TaskError::Abort(value)) => task.resume(value),
                    Err(e) => task.throw(e),
                },
                Signal::Branch(children) => match self.run_branch(children) {
                    Ok(values) => task.resume(Value::List(values)),
                    Err(TaskError::Abort(value)) => task.resume(value),
                    Err(e) => task.throw(e),
                },
            };
        }
    }

    fn run_branch(&mut self, children: Vec<BoxTask>) -> Result<Vec<Value>, TaskError> {
        let mut results = Vec::with_capacity(children.len());
        let mut pending = children.into_iter();
        while let Some(child) = pending.next() {
            match self.execute(child) {
                Ok(value) => results.push(value),
                Err(e) => {
                    for rest in pending {
                        self.stats.cancellations += 1;
                        self.discard(rest);
                    }
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Close a unit that is never going to run.
    fn discard(&mut self, mut task: BoxTask) {
        if let Err(e) = task.close() {
            warn!(task = %task.label(), error = %e, "closing unstarted task failed");
        }
    }
}

impl TaskGraph for SerialTaskGraph {
    fn run(&mut self, root: BoxTask) -> Outcome {
        self.cache.clear();
        self.stats.begin();
        let outcome = self.execute(root);
        self.cache.clear();
        self.stats.finish("serial", outcome.is_ok());
        outcome
    }

    fn stats(&self) -> &GraphStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::{probe, ScriptedTask};

    #[test]
    fn branch_stops_at_first_error_and_closes_the_rest() {
        let (pa, pb, pc) = (probe(), probe(), probe());
        let a = ScriptedTask::new(None, &pa).returning(1);
        let b = ScriptedTask::new(None, &pb).step(|| Err(TaskError::msg("b broke")));
        let c = ScriptedTask::new(None, &pc).returning(3);
        let parent_probe = probe();
        let parent = ScriptedTask::new(None, &parent_probe)
            .step(move || Ok(Signal::branch([a.boxed(), b.boxed(), c.boxed()])))
            .recovering();

        let mut graph = SerialTaskGraph::new();
        let value = graph.run(parent.boxed()).unwrap();
        assert_eq!(value.as_str(), Some("b broke"));
        assert_eq!(pa.borrow().resumes, 1);
        assert_eq!(pb.borrow().resumes, 1);
        assert_eq!(pc.borrow().resumes, 0);
        assert_eq!(pc.borrow().closes, 1);
        assert_eq!(parent_probe.borrow().throws, 1);
        assert_eq!(graph.stats().cancellations, 1);
    }

    #[test]
    fn block_waits_then_resumes_without_input() {
        let p = probe();
        let task = ScriptedTask::new(None, &p)
            .step(|| Ok(Signal::Block))
            .returning("done");
        let mut graph = SerialTaskGraph::new();
        assert_eq!(graph.run(task.boxed()).unwrap().as_str(), Some("done"));
        assert_eq!(p.borrow().inputs, vec![Value::None, Value::None]);
    }

    #[test]
    fn cache_does_not_survive_runs() {
        let p = probe();
        let mut graph = SerialTaskGraph::new();
        graph.run(ScriptedTask::new(Some("k"), &p).returning(1).boxed()).unwrap();
        graph.run(ScriptedTask::new(Some("k"), &p).returning(2).boxed()).unwrap();
        assert_eq!(p.borrow().resumes, 2);
    }
}
